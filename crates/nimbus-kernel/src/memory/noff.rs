//! Reader for the NOFF object format: a magic word followed by the code,
//! initialized-data, and uninitialized-data segment descriptors.

use crate::error::KernelError;

pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

#[derive(Debug, Clone, Copy, Default)]
pub struct Segment {
    pub virtual_addr: u32,
    pub in_file_addr: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoffHeader {
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    /// Ten little-endian words: the magic plus three segment descriptors.
    pub const SIZE: usize = 40;

    /// Parse the header. An executable written on a machine of the other
    /// byte order is detected by the byte-swapped magic and every field is
    /// swapped on load.
    pub fn parse(bytes: &[u8]) -> Result<Self, KernelError> {
        if bytes.len() < Self::SIZE {
            return Err(KernelError::BadExecutable("truncated NOFF header".into()));
        }
        let mut words = [0u32; 10];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().expect("4-byte chunk"));
        }
        if words[0] != NOFF_MAGIC {
            if words[0].swap_bytes() == NOFF_MAGIC {
                for word in &mut words {
                    *word = word.swap_bytes();
                }
            } else {
                return Err(KernelError::BadExecutable(format!(
                    "bad NOFF magic {:#x}",
                    words[0]
                )));
            }
        }
        let segment = |at: usize| Segment {
            virtual_addr: words[at],
            in_file_addr: words[at + 1],
            size: words[at + 2],
        };
        Ok(Self {
            code: segment(1),
            init_data: segment(4),
            uninit_data: segment(7),
        })
    }

    /// Serialize the header, for tools that build NOFF images.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let words = [
            NOFF_MAGIC,
            self.code.virtual_addr,
            self.code.in_file_addr,
            self.code.size,
            self.init_data.virtual_addr,
            self.init_data.in_file_addr,
            self.init_data.size,
            self.uninit_data.virtual_addr,
            self.uninit_data.in_file_addr,
            self.uninit_data.size,
        ];
        let mut bytes = [0u8; Self::SIZE];
        for (i, word) in words.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode() {
        let hdr = NoffHeader {
            code: Segment { virtual_addr: 0, in_file_addr: 40, size: 256 },
            init_data: Segment { virtual_addr: 256, in_file_addr: 296, size: 64 },
            uninit_data: Segment { virtual_addr: 320, in_file_addr: 0, size: 128 },
        };
        let back = NoffHeader::parse(&hdr.encode()).unwrap();
        assert_eq!(back.code.size, 256);
        assert_eq!(back.init_data.virtual_addr, 256);
        assert_eq!(back.uninit_data.size, 128);
    }

    #[test]
    fn accepts_the_byte_swapped_magic() {
        let hdr = NoffHeader {
            code: Segment { virtual_addr: 0, in_file_addr: 40, size: 0x100 },
            ..Default::default()
        };
        let mut bytes = hdr.encode();
        for chunk in bytes.chunks_exact_mut(4) {
            chunk.reverse();
        }
        let back = NoffHeader::parse(&bytes).unwrap();
        assert_eq!(back.code.size, 0x100);
    }

    #[test]
    fn rejects_garbage() {
        assert!(NoffHeader::parse(&[0u8; 40]).is_err());
        assert!(NoffHeader::parse(&[0u8; 10]).is_err());
    }
}
