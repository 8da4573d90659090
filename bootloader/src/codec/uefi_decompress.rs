//! UEFI standard and Tiano decompression
//!
//! Both formats are an LZ77 window coded with three Huffman alphabets (char
//! and length, position, and the code-length alphabet). They differ only in
//! the width of the position-set count: 4 bits for the standard scheme and
//! 5 bits for the Tiano variant.
//!
//! All decoding tables live in the caller-supplied scratch buffer so the
//! decoder itself needs only a few words of stack.

use super::{Codec, CodecInput, CodecSizes};
use crate::error::{LoaderError, Result};
use crate::security::AuthStatus;

const BITBUFSIZ: u32 = 32;
const MAXMATCH: usize = 256;
const THRESHOLD: u16 = 3;
const CODE_BIT: usize = 16;
const UINT8_MAX: u16 = 0xFF;

/// Char and length alphabet size
const NC: usize = UINT8_MAX as usize + MAXMATCH + 2 - THRESHOLD as usize;
const CBIT: u16 = 9;
const MAXPBIT: usize = 5;
const TBIT: u16 = 5;
/// Position alphabet size
const MAXNP: usize = (1 << MAXPBIT) - 1;
/// Code-length alphabet size
const NT: usize = CODE_BIT + 3;
const NPT: usize = if NT > MAXNP { NT } else { MAXNP };

const TREE_NODES: usize = 2 * NC - 1;
const C_TABLE_LEN: usize = 4096;
const PT_TABLE_LEN: usize = 256;

const LEFT_OFFSET: usize = 0;
const RIGHT_OFFSET: usize = LEFT_OFFSET + TREE_NODES * 2;
const C_LEN_OFFSET: usize = RIGHT_OFFSET + TREE_NODES * 2;
const PT_LEN_OFFSET: usize = C_LEN_OFFSET + NC;
const C_TABLE_OFFSET: usize = PT_LEN_OFFSET + NPT;
const PT_TABLE_OFFSET: usize = C_TABLE_OFFSET + C_TABLE_LEN * 2;

/// Scratch bytes required by [`UefiDecompressCodec::transform`]
pub const SCRATCH_SIZE: usize = PT_TABLE_OFFSET + PT_TABLE_LEN * 2;

/// Compressed and original size prefix
pub const HEADER_SIZE: usize = 8;

/// Parsed size prefix of a compressed stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub compressed_size: usize,
    pub original_size: usize,
}

impl StreamHeader {
    pub fn parse(source: &[u8]) -> Result<Self> {
        let header = source.get(..HEADER_SIZE).ok_or(LoaderError::VolumeCorrupted)?;
        let compressed_size =
            u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let original_size =
            u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let end = compressed_size
            .checked_add(HEADER_SIZE)
            .ok_or(LoaderError::VolumeCorrupted)?;
        if end > source.len() {
            log::warn!(
                "compressed stream truncated: {:#x} bytes declared, {:#x} present",
                compressed_size,
                source.len() - HEADER_SIZE
            );
            return Err(LoaderError::VolumeCorrupted);
        }

        Ok(Self {
            compressed_size,
            original_size,
        })
    }
}

/// Decoder for compression scheme 1 and the Tiano GUID-defined section
#[derive(Debug, Clone, Copy)]
pub struct UefiDecompressCodec {
    position_bits: u16,
    name: &'static str,
}

impl UefiDecompressCodec {
    /// Standard compression (4-bit position set)
    pub const fn standard() -> Self {
        Self {
            position_bits: 4,
            name: "uefi-decompress",
        }
    }

    /// Tiano compression (5-bit position set)
    pub const fn tiano() -> Self {
        Self {
            position_bits: 5,
            name: "tiano-decompress",
        }
    }

    /// Decompress `source` (size prefix included) into `output`
    pub fn decompress(&self, source: &[u8], scratch: &mut [u8], output: &mut [u8]) -> Result<usize> {
        let header = StreamHeader::parse(source)?;
        let output = output
            .get_mut(..header.original_size)
            .ok_or(LoaderError::BufferTooSmall)?;
        let scratch = scratch
            .get_mut(..SCRATCH_SIZE)
            .ok_or(LoaderError::BufferTooSmall)?;
        scratch.fill(0);

        if header.original_size == 0 {
            return Ok(0);
        }

        let mut decoder = Decoder {
            source: &source[HEADER_SIZE..HEADER_SIZE + header.compressed_size],
            in_pos: 0,
            compressed_left: header.compressed_size,
            output,
            out_pos: 0,
            bit_buf: 0,
            sub_bit_buf: 0,
            bit_count: 0,
            block_size: 0,
            position_bits: self.position_bits,
            tables: Tables { bytes: scratch },
        };
        decoder.fill_buf(BITBUFSIZ as u16);
        decoder.decode()?;
        Ok(decoder.out_pos)
    }
}

impl Codec for UefiDecompressCodec {
    fn name(&self) -> &'static str {
        self.name
    }

    fn size_query(&self, input: &CodecInput<'_>) -> Result<CodecSizes> {
        let header = StreamHeader::parse(input.payload)?;
        Ok(CodecSizes {
            output_size: header.original_size,
            scratch_size: SCRATCH_SIZE,
        })
    }

    fn transform(
        &self,
        input: &CodecInput<'_>,
        scratch: &mut [u8],
        output: &mut [u8],
    ) -> Result<AuthStatus> {
        self.decompress(input.payload, scratch, output)?;
        Ok(AuthStatus::empty())
    }
}

fn bad_table() -> LoaderError {
    LoaderError::VolumeCorrupted
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Alphabet {
    CharLen,
    PositionOrLength,
}

#[derive(Clone, Copy)]
enum Slot {
    Table(usize),
    Left(usize),
    Right(usize),
}

/// Decoding tables laid out in the scratch buffer
struct Tables<'s> {
    bytes: &'s mut [u8],
}

impl Tables<'_> {
    fn word(&self, base: usize, len: usize, index: usize) -> Result<u16> {
        if index >= len {
            return Err(bad_table());
        }
        let offset = base + index * 2;
        Ok(u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]]))
    }

    fn set_word(&mut self, base: usize, len: usize, index: usize, value: u16) -> Result<()> {
        if index >= len {
            return Err(bad_table());
        }
        let offset = base + index * 2;
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn byte(&self, base: usize, len: usize, index: usize) -> Result<u8> {
        if index >= len {
            return Err(bad_table());
        }
        Ok(self.bytes[base + index])
    }

    fn set_byte(&mut self, base: usize, len: usize, index: usize, value: u8) -> Result<()> {
        if index >= len {
            return Err(bad_table());
        }
        self.bytes[base + index] = value;
        Ok(())
    }

    fn left(&self, node: u16) -> Result<u16> {
        self.word(LEFT_OFFSET, TREE_NODES, node as usize)
    }

    fn right(&self, node: u16) -> Result<u16> {
        self.word(RIGHT_OFFSET, TREE_NODES, node as usize)
    }

    fn bit_len(&self, alphabet: Alphabet, symbol: usize) -> Result<u8> {
        match alphabet {
            Alphabet::CharLen => self.byte(C_LEN_OFFSET, NC, symbol),
            Alphabet::PositionOrLength => self.byte(PT_LEN_OFFSET, NPT, symbol),
        }
    }

    fn set_bit_len(&mut self, alphabet: Alphabet, symbol: usize, len: u8) -> Result<()> {
        match alphabet {
            Alphabet::CharLen => self.set_byte(C_LEN_OFFSET, NC, symbol, len),
            Alphabet::PositionOrLength => self.set_byte(PT_LEN_OFFSET, NPT, symbol, len),
        }
    }

    fn table(&self, alphabet: Alphabet, index: usize) -> Result<u16> {
        match alphabet {
            Alphabet::CharLen => self.word(C_TABLE_OFFSET, C_TABLE_LEN, index),
            Alphabet::PositionOrLength => self.word(PT_TABLE_OFFSET, PT_TABLE_LEN, index),
        }
    }

    fn set_table(&mut self, alphabet: Alphabet, index: usize, value: u16) -> Result<()> {
        match alphabet {
            Alphabet::CharLen => self.set_word(C_TABLE_OFFSET, C_TABLE_LEN, index, value),
            Alphabet::PositionOrLength => {
                self.set_word(PT_TABLE_OFFSET, PT_TABLE_LEN, index, value)
            }
        }
    }

    fn slot(&self, alphabet: Alphabet, slot: Slot) -> Result<u16> {
        match slot {
            Slot::Table(index) => self.table(alphabet, index),
            Slot::Left(node) => self.word(LEFT_OFFSET, TREE_NODES, node),
            Slot::Right(node) => self.word(RIGHT_OFFSET, TREE_NODES, node),
        }
    }

    fn set_slot(&mut self, alphabet: Alphabet, slot: Slot, value: u16) -> Result<()> {
        match slot {
            Slot::Table(index) => self.set_table(alphabet, index, value),
            Slot::Left(node) => self.set_word(LEFT_OFFSET, TREE_NODES, node, value),
            Slot::Right(node) => self.set_word(RIGHT_OFFSET, TREE_NODES, node, value),
        }
    }
}

struct Decoder<'a, 's> {
    source: &'a [u8],
    in_pos: usize,
    compressed_left: usize,
    output: &'a mut [u8],
    out_pos: usize,
    bit_buf: u32,
    sub_bit_buf: u32,
    bit_count: u16,
    block_size: u16,
    position_bits: u16,
    tables: Tables<'s>,
}

impl Decoder<'_, '_> {
    /// Shift `count` bits out of the bit buffer and refill from the source
    fn fill_buf(&mut self, count: u16) {
        let mut count = count;
        self.bit_buf = self.bit_buf.checked_shl(count as u32).unwrap_or(0);
        while count > self.bit_count {
            count -= self.bit_count;
            self.bit_buf |= self.sub_bit_buf.checked_shl(count as u32).unwrap_or(0);
            if self.compressed_left > 0 {
                self.compressed_left -= 1;
                self.sub_bit_buf = self.source.get(self.in_pos).copied().unwrap_or(0) as u32;
                self.in_pos += 1;
            } else {
                self.sub_bit_buf = 0;
            }
            self.bit_count = 8;
        }
        self.bit_count -= count;
        self.bit_buf |= self.sub_bit_buf >> self.bit_count;
    }

    fn get_bits(&mut self, count: u16) -> u16 {
        let bits = self
            .bit_buf
            .checked_shr(BITBUFSIZ - count as u32)
            .unwrap_or(0);
        self.fill_buf(count);
        bits as u16
    }

    /// Build the lookup table and overflow tree for `alphabet`
    fn make_table(&mut self, alphabet: Alphabet, symbols: usize, table_bits: u16) -> Result<()> {
        let mut count = [0u16; 17];
        let mut weight = [0u16; 17];
        let mut start = [0u16; 18];

        for symbol in 0..symbols {
            let len = self.tables.bit_len(alphabet, symbol)? as usize;
            if len > 16 {
                return Err(bad_table());
            }
            count[len] += 1;
        }

        for index in 1..=16usize {
            let span = ((count[index] as u32) << (16 - index)) as u16;
            start[index + 1] = start[index].wrapping_add(span);
        }
        if start[17] != 0 {
            return Err(bad_table());
        }

        let table_bits_usize = table_bits as usize;
        let ju_bits = 16 - table_bits;
        for index in 1..=table_bits_usize {
            start[index] >>= ju_bits;
            weight[index] = 1 << (table_bits_usize - index);
        }
        for (index, slot) in weight.iter_mut().enumerate().skip(table_bits_usize + 1) {
            *slot = 1 << (16 - index);
        }

        let first_unused = (start[table_bits_usize + 1] >> ju_bits) as usize;
        let table_len = 1usize << table_bits;
        if first_unused != 0 {
            for index in first_unused..table_len {
                self.tables.set_table(alphabet, index, 0)?;
            }
        }

        let mut avail = symbols as u16;
        let mask = 1u16 << (15 - table_bits);

        for symbol in 0..symbols {
            let len = self.tables.bit_len(alphabet, symbol)? as usize;
            if len == 0 {
                continue;
            }
            let next_code = start[len].wrapping_add(weight[len]);

            if len <= table_bits_usize {
                if start[len] >= next_code || next_code as usize > table_len {
                    return Err(bad_table());
                }
                for index in start[len]..next_code {
                    self.tables.set_table(alphabet, index as usize, symbol as u16)?;
                }
            } else {
                let mut code = start[len];
                let mut slot = Slot::Table((code >> ju_bits) as usize);
                for _ in 0..(len - table_bits_usize) {
                    if self.tables.slot(alphabet, slot)? == 0 && (avail as usize) < TREE_NODES {
                        self.tables.set_slot(alphabet, Slot::Right(avail as usize), 0)?;
                        self.tables.set_slot(alphabet, Slot::Left(avail as usize), 0)?;
                        self.tables.set_slot(alphabet, slot, avail)?;
                        avail += 1;
                    }
                    let node = self.tables.slot(alphabet, slot)?;
                    if (node as usize) < TREE_NODES {
                        slot = if code & mask != 0 {
                            Slot::Right(node as usize)
                        } else {
                            Slot::Left(node as usize)
                        };
                    }
                    code <<= 1;
                }
                self.tables.set_slot(alphabet, slot, symbol as u16)?;
            }

            start[len] = next_code;
        }

        Ok(())
    }

    /// Walk the overflow tree below a table hit until a leaf `< limit`
    fn walk_tree(&self, mut node: u16, limit: usize, first_mask_bit: u32) -> Result<u16> {
        let mut mask = 1u32 << first_mask_bit;
        while node as usize >= limit {
            if mask == 0 {
                return Err(bad_table());
            }
            node = if self.bit_buf & mask != 0 {
                self.tables.right(node)?
            } else {
                self.tables.left(node)?
            };
            mask >>= 1;
        }
        Ok(node)
    }

    /// Read the code lengths of the position or code-length alphabet
    fn read_pt_len(&mut self, symbols: usize, count_bits: u16, special: Option<usize>) -> Result<()> {
        let alphabet = Alphabet::PositionOrLength;
        let number = self.get_bits(count_bits) as usize;
        if number == 0 {
            let symbol = self.get_bits(count_bits);
            for index in 0..PT_TABLE_LEN {
                self.tables.set_table(alphabet, index, symbol)?;
            }
            for index in 0..symbols {
                self.tables.set_bit_len(alphabet, index, 0)?;
            }
            return Ok(());
        }

        let mut index = 0usize;
        while index < number && index < NPT {
            let mut len = (self.bit_buf >> (BITBUFSIZ - 3)) as u16;
            if len == 7 {
                let mut mask = 1u32 << (BITBUFSIZ - 1 - 3);
                while mask & self.bit_buf != 0 {
                    mask >>= 1;
                    len += 1;
                }
            }
            self.fill_buf(if len < 7 { 3 } else { len - 3 });
            self.tables.set_bit_len(alphabet, index, len as u8)?;
            index += 1;

            if Some(index) == special {
                let zeros = self.get_bits(2) as usize;
                for _ in 0..zeros {
                    if index >= NPT {
                        break;
                    }
                    self.tables.set_bit_len(alphabet, index, 0)?;
                    index += 1;
                }
            }
        }

        while index < symbols && index < NPT {
            self.tables.set_bit_len(alphabet, index, 0)?;
            index += 1;
        }

        self.make_table(alphabet, symbols, 8)
    }

    /// Read the code lengths of the char and length alphabet
    fn read_c_len(&mut self) -> Result<()> {
        let alphabet = Alphabet::CharLen;
        let number = self.get_bits(CBIT) as usize;
        if number == 0 {
            let symbol = self.get_bits(CBIT);
            for index in 0..NC {
                self.tables.set_bit_len(alphabet, index, 0)?;
            }
            for index in 0..C_TABLE_LEN {
                self.tables.set_table(alphabet, index, symbol)?;
            }
            return Ok(());
        }

        let mut index = 0usize;
        while index < number && index < NC {
            let hit = self
                .tables
                .table(Alphabet::PositionOrLength, (self.bit_buf >> (BITBUFSIZ - 8)) as usize)?;
            let code = self.walk_tree(hit, NT, BITBUFSIZ - 1 - 8)?;
            let len = self
                .tables
                .bit_len(Alphabet::PositionOrLength, code as usize)?;
            self.fill_buf(len as u16);

            if code <= 2 {
                let zeros = match code {
                    0 => 1,
                    1 => self.get_bits(4) as usize + 3,
                    _ => self.get_bits(CBIT) as usize + 20,
                };
                for _ in 0..zeros {
                    if index >= NC {
                        break;
                    }
                    self.tables.set_bit_len(alphabet, index, 0)?;
                    index += 1;
                }
            } else {
                self.tables.set_bit_len(alphabet, index, (code - 2) as u8)?;
                index += 1;
            }
        }

        while index < NC {
            self.tables.set_bit_len(alphabet, index, 0)?;
            index += 1;
        }

        self.make_table(alphabet, NC, 12)
    }

    /// Decode one char-or-length symbol, reading a block header when due
    fn decode_c(&mut self) -> Result<u16> {
        if self.block_size == 0 {
            self.block_size = self.get_bits(16);
            self.read_pt_len(NT, TBIT, Some(3))?;
            self.read_c_len()?;
            self.read_pt_len(MAXNP, self.position_bits, None)?;
        }
        self.block_size = self.block_size.wrapping_sub(1);

        let hit = self
            .tables
            .table(Alphabet::CharLen, (self.bit_buf >> (BITBUFSIZ - 12)) as usize)?;
        let symbol = self.walk_tree(hit, NC, BITBUFSIZ - 1 - 12)?;
        let len = self.tables.bit_len(Alphabet::CharLen, symbol as usize)?;
        self.fill_buf(len as u16);
        Ok(symbol)
    }

    /// Decode a match position
    fn decode_p(&mut self) -> Result<u32> {
        let hit = self
            .tables
            .table(Alphabet::PositionOrLength, (self.bit_buf >> (BITBUFSIZ - 8)) as usize)?;
        let symbol = self.walk_tree(hit, MAXNP, BITBUFSIZ - 1 - 8)?;
        let len = self
            .tables
            .bit_len(Alphabet::PositionOrLength, symbol as usize)?;
        self.fill_buf(len as u16);

        if symbol > 1 {
            Ok((1u32 << (symbol - 1)) + self.get_bits(symbol - 1) as u32)
        } else {
            Ok(symbol as u32)
        }
    }

    fn decode(&mut self) -> Result<()> {
        let original_size = self.output.len();
        loop {
            let symbol = self.decode_c()?;
            if symbol <= UINT8_MAX {
                if self.out_pos >= original_size {
                    return Ok(());
                }
                self.output[self.out_pos] = symbol as u8;
                self.out_pos += 1;
                continue;
            }

            let length = (symbol - (UINT8_MAX + 1 - THRESHOLD)) as usize;
            let distance = self.decode_p()? as usize;
            let mut from = self
                .out_pos
                .checked_sub(distance + 1)
                .ok_or_else(bad_table)?;
            for _ in 0..length {
                if self.out_pos >= original_size {
                    return Ok(());
                }
                self.output[self.out_pos] = self.output[from];
                self.out_pos += 1;
                from += 1;
            }
            if self.out_pos >= original_size {
                return Ok(());
            }
        }
    }
}
