//! Synthetic UF2 files for tests

use super::uf2::{
    Uf2Flags, BLOCK_SIZE, MAGIC_END, MAGIC_START0, MAGIC_START1, REBOOT_EXTENSION_TAG,
};

/// Builder for one UF2 block
///
/// Block numbers and the total count are filled in by [`build_uf2`].
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    flags: u32,
    addr: u32,
    payload: Vec<u8>,
    family: Option<u32>,
    extensions: Vec<(u32, Vec<u8>)>,
}

impl BlockBuilder {
    /// Main-flash block placing `payload` at `addr`
    pub fn new(addr: u32, payload: &[u8]) -> Self {
        Self {
            flags: 0,
            addr,
            payload: payload.to_vec(),
            family: None,
            extensions: Vec::new(),
        }
    }

    /// Reboot marker writing `trigger` at `addr`, restarting at `reboot_addr`
    pub fn reboot(addr: u32, trigger: &[u8], reboot_addr: u32) -> Self {
        Self::new(addr, trigger)
            .flags(Uf2Flags::NOT_MAIN_FLASH)
            .extension(REBOOT_EXTENSION_TAG, &reboot_addr.to_le_bytes())
    }

    /// Add block flags
    pub fn flags(mut self, flags: Uf2Flags) -> Self {
        self.flags |= flags.bits();
        self
    }

    /// Set the family ID
    pub fn family(mut self, family: u32) -> Self {
        self.family = Some(family);
        self
    }

    /// Append an extension tag
    pub fn extension(mut self, tag: u32, payload: &[u8]) -> Self {
        self.extensions.push((tag, payload.to_vec()));
        self
    }

    /// Encode as block `block_no` of `num_blocks`
    pub fn encode(&self, block_no: u32, num_blocks: u32) -> Vec<u8> {
        let mut flags = self.flags;
        if self.family.is_some() {
            flags |= Uf2Flags::FAMILY_ID_PRESENT.bits();
        }
        if !self.extensions.is_empty() {
            flags |= Uf2Flags::EXTENSION_TAGS_PRESENT.bits();
        }

        let mut out = Vec::with_capacity(BLOCK_SIZE);
        for word in [
            MAGIC_START0,
            MAGIC_START1,
            flags,
            self.addr,
            self.payload.len() as u32,
            block_no,
            num_blocks,
            self.family.unwrap_or(0),
        ] {
            out.extend_from_slice(&word.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        while out.len() % 4 != 0 {
            out.push(0);
        }
        for (tag, payload) in &self.extensions {
            let len = 4 + payload.len() as u32;
            out.extend_from_slice(&((tag << 8) | len).to_le_bytes());
            out.extend_from_slice(payload);
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }
        out.resize(BLOCK_SIZE - 4, 0);
        out.extend_from_slice(&MAGIC_END.to_le_bytes());
        out
    }
}

/// Assemble a complete UF2 file with correct numbering
pub fn build_uf2(blocks: &[BlockBuilder]) -> Vec<u8> {
    let total = blocks.len() as u32;
    blocks
        .iter()
        .enumerate()
        .flat_map(|(i, b)| b.encode(i as u32, total))
        .collect()
}

/// Split a payload into standard 256-byte blocks
pub fn flash_blocks(addr: u32, payload: &[u8]) -> Vec<BlockBuilder> {
    payload
        .chunks(256)
        .enumerate()
        .map(|(i, chunk)| BlockBuilder::new(addr + (i as u32) * 256, chunk))
        .collect()
}
