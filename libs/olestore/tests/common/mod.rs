//! Synthetic container assembly for tests

#![allow(dead_code)]

pub const SECTOR: usize = 512;
pub const MINI: usize = 64;
pub const CUTOFF: usize = 4096;

pub const ENDOFCHAIN: u32 = 0xfffffffe;
pub const FREESECT: u32 = 0xffffffff;
const FATSECT: u32 = 0xfffffffd;
const DIFSECT: u32 = 0xfffffffc;

const PER_FAT: usize = SECTOR / 4;
const PER_DIFAT: usize = PER_FAT - 1;

/// Lays out streams into a version 3 container (512 byte sectors, 64 byte mini sectors)
#[derive(Default)]
pub struct ContainerBuilder {
    sectors: Vec<Vec<u8>>,
    fat: Vec<u32>,
    mini: Vec<u8>,
    ssat: Vec<u32>,
    entries: Vec<(String, u32, u32)>,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` unused sectors in front of everything added later
    pub fn pad_sectors(&mut self, n: usize) -> &mut Self {
        for _ in 0..n {
            self.alloc_one(&[]);
        }
        self
    }

    fn alloc_one(&mut self, chunk: &[u8]) -> u32 {
        let mut s = chunk.to_vec();
        s.resize(SECTOR, 0);
        self.sectors.push(s);
        self.fat.push(FREESECT);
        (self.sectors.len() - 1) as u32
    }

    fn alloc(&mut self, data: &[u8]) -> Vec<u32> {
        data.chunks(SECTOR).map(|c| self.alloc_one(c)).collect()
    }

    fn chain(&mut self, ids: &[u32]) {
        for w in ids.windows(2) {
            self.fat[w[0] as usize] = w[1];
        }
        if let Some(&last) = ids.last() {
            self.fat[last as usize] = ENDOFCHAIN;
        }
    }

    /// Adds a stream; small streams go to the mini stream
    ///
    /// Returns the large sector chain (empty for small streams)
    pub fn add_stream(&mut self, name: &str, data: &[u8]) -> Vec<u32> {
        self.add_stream_sized(name, data, data.len() as u32)
    }

    /// Same as `add_stream` but with a declared size which may lie
    pub fn add_stream_sized(&mut self, name: &str, data: &[u8], size: u32) -> Vec<u32> {
        if (size as usize) < CUTOFF {
            let n = data.len().div_ceil(MINI);
            let start = (self.mini.len() / MINI) as u32;
            self.mini.extend_from_slice(data);
            self.mini.resize(self.mini.len().div_ceil(MINI) * MINI, 0);
            for i in 0..n as u32 {
                self.ssat.push(if i + 1 < n as u32 {
                    start + i + 1
                } else {
                    ENDOFCHAIN
                });
            }
            let start = if n == 0 { ENDOFCHAIN } else { start };
            self.entries.push((name.to_string(), start, size));
            Vec::new()
        } else {
            let ids = self.alloc(data);
            self.chain(&ids);
            self.entries
                .push((name.to_string(), ids.first().copied().unwrap_or(ENDOFCHAIN), size));
            ids
        }
    }

    /// Adds a large stream whose sectors are laid out back to front
    pub fn add_stream_reversed(&mut self, name: &str, data: &[u8]) -> Vec<u32> {
        let chunks: Vec<&[u8]> = data.chunks(SECTOR).collect();
        let mut ids: Vec<u32> = chunks.iter().rev().map(|c| self.alloc_one(c)).collect();
        ids.reverse();
        self.chain(&ids);
        self.entries
            .push((name.to_string(), ids[0], data.len() as u32));
        ids
    }

    /// Overrides the FAT entry of sector `id`
    pub fn set_next(&mut self, id: u32, next: u32) -> &mut Self {
        self.fat[id as usize] = next;
        self
    }

    pub fn build(&mut self) -> Vec<u8> {
        let (root_start, root_size) = if self.mini.is_empty() {
            (ENDOFCHAIN, 0)
        } else {
            let mini = self.mini.clone();
            let ids = self.alloc(&mini);
            self.chain(&ids);
            (ids[0], mini.len() as u32)
        };

        let (ssat_start, ssat_count) = if self.ssat.is_empty() {
            (ENDOFCHAIN, 0)
        } else {
            let mut bytes: Vec<u8> = self.ssat.iter().flat_map(|v| v.to_le_bytes()).collect();
            while bytes.len() % SECTOR != 0 {
                bytes.extend_from_slice(&FREESECT.to_le_bytes());
            }
            let ids = self.alloc(&bytes);
            self.chain(&ids);
            (ids[0], ids.len() as u32)
        };

        let mut dir = dir_entry("Root Entry", 5, root_start, root_size).to_vec();
        for (name, start, size) in self.entries.clone() {
            dir.extend_from_slice(&dir_entry(&name, 2, start, size));
        }
        dir.resize(dir.len().div_ceil(SECTOR) * SECTOR, 0);
        let dir_ids = self.alloc(&dir);
        self.chain(&dir_ids);

        let (mut nfat, mut ndif) = (0, 0);
        loop {
            let total = self.sectors.len() + nfat + ndif;
            let need_fat = total.div_ceil(PER_FAT);
            let need_dif = need_fat.saturating_sub(109).div_ceil(PER_DIFAT);
            if need_fat == nfat && need_dif == ndif {
                break;
            }
            (nfat, ndif) = (need_fat, need_dif);
        }
        let first_fat = self.sectors.len() as u32;
        let fat_ids: Vec<u32> = (first_fat..first_fat + nfat as u32).collect();
        let dif_ids: Vec<u32> =
            (first_fat + nfat as u32..first_fat + (nfat + ndif) as u32).collect();
        self.fat.extend(fat_ids.iter().map(|_| FATSECT));
        self.fat.extend(dif_ids.iter().map(|_| DIFSECT));
        self.fat.resize(nfat * PER_FAT, FREESECT);
        let fat_bytes: Vec<u8> = self.fat.iter().flat_map(|v| v.to_le_bytes()).collect();
        for chunk in fat_bytes.chunks(SECTOR) {
            self.alloc_one(chunk);
        }
        let overflow: Vec<u32> = fat_ids.iter().skip(109).copied().collect();
        for (i, chunk) in overflow.chunks(PER_DIFAT).enumerate() {
            let mut entries = chunk.to_vec();
            entries.resize(PER_DIFAT, FREESECT);
            entries.push(dif_ids.get(i + 1).copied().unwrap_or(ENDOFCHAIN));
            let bytes: Vec<u8> = entries.iter().flat_map(|v| v.to_le_bytes()).collect();
            self.alloc_one(&bytes);
        }

        let mut h = vec![0u8; SECTOR];
        h[0..8].copy_from_slice(&[0xd0, 0xcf, 0x11, 0xe0, 0xa1, 0xb1, 0x1a, 0xe1]);
        put16(&mut h, 0x18, 0x3e);
        put16(&mut h, 0x1a, 3);
        put16(&mut h, 0x1c, 0xfffe);
        put16(&mut h, 0x1e, 9);
        put16(&mut h, 0x20, 6);
        put32(&mut h, 0x2c, nfat as u32);
        put32(&mut h, 0x30, dir_ids[0]);
        put32(&mut h, 0x38, CUTOFF as u32);
        put32(&mut h, 0x3c, ssat_start);
        put32(&mut h, 0x40, ssat_count);
        put32(&mut h, 0x44, dif_ids.first().copied().unwrap_or(ENDOFCHAIN));
        put32(&mut h, 0x48, ndif as u32);
        for i in 0..109 {
            put32(
                &mut h,
                0x4c + i * 4,
                fat_ids.get(i).copied().unwrap_or(FREESECT),
            );
        }
        let mut out = h;
        for s in &self.sectors {
            out.extend_from_slice(s);
        }
        out
    }
}

fn put16(buf: &mut [u8], offset: usize, v: u16) {
    buf[offset..offset + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(buf: &mut [u8], offset: usize, v: u32) {
    buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
}

fn dir_entry(name: &str, objtype: u8, start: u32, size: u32) -> [u8; 128] {
    let mut e = [0u8; 128];
    let units: Vec<u16> = name.encode_utf16().collect();
    for (i, u) in units.iter().enumerate() {
        put16(&mut e, i * 2, *u);
    }
    put16(&mut e, 0x40, ((units.len() + 1) * 2) as u16);
    e[0x42] = objtype;
    put32(&mut e, 0x44, FREESECT);
    put32(&mut e, 0x48, FREESECT);
    put32(&mut e, 0x4c, FREESECT);
    put32(&mut e, 0x74, start);
    put32(&mut e, 0x78, size);
    e
}

/// Deterministic test payload
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}
