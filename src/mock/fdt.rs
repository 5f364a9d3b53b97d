use std::{string::String, vec::Vec};

const HEADER_LEN: usize = 40;
const RSVMAP_LEN: usize = 16;

/// Builds flattened device tree blobs for tests.
///
/// Nodes are not required to be balanced, so malformed trees can be built as well.
#[derive(Default)]
pub struct FdtBuilder {
    structs: Vec<u8>,
    strings: Vec<u8>,
    names: Vec<(String, u32)>,
}

impl FdtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn word(&mut self, word: u32) {
        self.structs.extend_from_slice(&word.to_be_bytes());
    }

    fn pad(&mut self) {
        while self.structs.len() % 4 != 0 {
            self.structs.push(0);
        }
    }

    fn name_offset(&mut self, name: &str) -> u32 {
        if let Some((_, offset)) = self.names.iter().find(|(n, _)| n == name) {
            return *offset;
        }
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(name.as_bytes());
        self.strings.push(0);
        self.names.push((String::from(name), offset));
        offset
    }

    pub fn begin(mut self, name: &str) -> Self {
        self.word(1);
        self.structs.extend_from_slice(name.as_bytes());
        self.structs.push(0);
        self.pad();
        self
    }

    pub fn end(mut self) -> Self {
        self.word(2);
        self
    }

    pub fn prop(mut self, name: &str, value: &[u8]) -> Self {
        let name = self.name_offset(name);
        self.word(3);
        self.word(value.len() as u32);
        self.word(name);
        self.structs.extend_from_slice(value);
        self.pad();
        self
    }

    pub fn prop_u32(self, name: &str, value: u32) -> Self {
        self.prop(name, &value.to_be_bytes())
    }

    pub fn prop_str(self, name: &str, value: &str) -> Self {
        let mut bytes = Vec::from(value.as_bytes());
        bytes.push(0);
        self.prop(name, &bytes)
    }

    /// Serialize the blob, zero padded to at least `pad_to` bytes.
    pub fn finish(mut self, pad_to: usize) -> Vec<u8> {
        self.word(9);

        let struct_offset = HEADER_LEN + RSVMAP_LEN;
        let strings_offset = struct_offset + self.structs.len();
        let total = usize::max(strings_offset + self.strings.len(), pad_to);

        let header = [
            0xd00d_feed,
            total as u32,
            struct_offset as u32,
            strings_offset as u32,
            HEADER_LEN as u32,
            17,
            16,
            0,
            self.strings.len() as u32,
            self.structs.len() as u32,
        ];

        let mut blob = Vec::with_capacity(total);
        for word in header {
            blob.extend_from_slice(&u32::to_be_bytes(word));
        }
        blob.extend_from_slice(&[0; RSVMAP_LEN]);
        blob.extend_from_slice(&self.structs);
        blob.extend_from_slice(&self.strings);
        blob.resize(total, 0);
        blob
    }
}
