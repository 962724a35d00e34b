//! Canonical-Huffman symbol table and bitstream decoder for zFITS tiles.
//!
//! A compressed cell stores its code table inline: per symbol, the 16-bit
//! symbol value, the total code length in bits, and the code bytes. Decoding
//! looks at 8 bits of lookahead at a time, so the table is materialized as a
//! trie of 256-slot nodes: each short code is replicated across every byte
//! value that shares its low bits, and codes longer than 8 bits descend into
//! a child node per consumed byte. Nodes live in a flat arena indexed by
//! `u32`, which keeps the decode loop free of pointer chasing.

use crate::error::{Error, Result};
use crate::stream::ByteStream;

/// One slot of a 256-entry trie node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    /// No code covers this lookahead byte at this depth.
    Empty,
    /// A complete code: emit `symbol`, consume `bits` (1..=8).
    Terminal { symbol: i16, bits: u8 },
    /// The code continues: consume 8 bits and look up the next node.
    Child(u32),
}

/// A canonical-Huffman decode table keyed by 8-bit lookahead windows.
pub struct SymbolTable {
    /// Node arena; index 0 is the root.
    nodes: Vec<[Slot; 256]>,
}

impl SymbolTable {
    /// Deserialize a symbol table from the front of a compressed payload.
    ///
    /// The wire layout is a `u64` symbol count followed, per symbol, by
    /// `{i16 value, u8 total bit length, ceil(len/8) code bytes}`. Fails with
    /// [`Error::MalformedTable`] if two codes collide or a code is empty,
    /// and with [`Error::Truncated`] if the stream ends mid-table.
    pub fn read(stream: &mut ByteStream<'_>) -> Result<Self> {
        let count = stream.read_u64_le()?;
        let mut table = SymbolTable {
            nodes: vec![[Slot::Empty; 256]],
        };
        for _ in 0..count {
            let symbol = stream.read_i16_le()?;
            let total_bits = stream.read_u8()?;
            if total_bits == 0 {
                return Err(Error::MalformedTable);
            }
            let num_bytes = (total_bits as usize).div_ceil(8);
            // Number of significant bits in the last code byte.
            let tail_bits = match total_bits % 8 {
                0 => 8,
                n => n,
            };
            let code = stream.read_bytes(num_bytes)?;
            table.insert(code, tail_bits, symbol)?;
        }
        Ok(table)
    }

    /// Number of trie nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn insert(&mut self, code: &[u8], tail_bits: u8, symbol: i16) -> Result<()> {
        let (&last, prefix) = match code.split_last() {
            Some(split) => split,
            None => return Err(Error::MalformedTable),
        };

        let mut node = 0usize;
        for &byte in prefix {
            node = self.descend(node, byte)?;
        }

        // Replicate the terminal across every byte whose low `tail_bits`
        // bits match the code's last byte, so any 8-bit lookahead resolves.
        let base = (last as u16) & ((1u16 << tail_bits) - 1);
        for fill in 0u16..(1u16 << (8 - tail_bits)) {
            let key = (base | (fill << tail_bits)) as usize;
            let slot = &mut self.nodes[node][key];
            match *slot {
                Slot::Empty => {
                    *slot = Slot::Terminal {
                        symbol,
                        bits: tail_bits,
                    };
                }
                Slot::Terminal { symbol: s, bits: b } if s == symbol && b == tail_bits => {}
                _ => return Err(Error::MalformedTable),
            }
        }
        Ok(())
    }

    /// Walk one full byte of a multi-byte code, creating the child node if
    /// it does not exist yet.
    fn descend(&mut self, node: usize, byte: u8) -> Result<usize> {
        match self.nodes[node][byte as usize] {
            Slot::Child(next) => Ok(next as usize),
            Slot::Empty => {
                let next = self.nodes.len();
                self.nodes.push([Slot::Empty; 256]);
                self.nodes[node][byte as usize] = Slot::Child(next as u32);
                Ok(next)
            }
            Slot::Terminal { .. } => Err(Error::MalformedTable),
        }
    }

    #[inline]
    fn lookup(&self, node: usize, key: u8) -> Slot {
        self.nodes[node][key as usize]
    }
}

/// Decode exactly `symbol_count` symbols from the packed bitstream.
///
/// A bit reservoir is kept in a plain integer: whenever fewer than 8 bits
/// are buffered, one more byte is OR-ed in above the current fill. The low
/// 8 bits index the current trie node; a child consumes the full window, a
/// terminal consumes only its own code bits. This is the hot loop, so there
/// is no per-bit bookkeeping of any kind.
pub fn decode(
    stream: &mut ByteStream<'_>,
    table: &SymbolTable,
    symbol_count: usize,
) -> Result<Vec<i16>> {
    let mut out = Vec::with_capacity(symbol_count);
    let mut reservoir: u64 = 0;
    let mut fill: u32 = 0;
    let mut node = 0usize;

    while out.len() < symbol_count {
        if fill < 8 {
            reservoir |= (stream.read_u8()? as u64) << fill;
            fill += 8;
        }
        match table.lookup(node, (reservoir & 0xFF) as u8) {
            Slot::Child(next) => {
                node = next as usize;
                reservoir >>= 8;
                fill -= 8;
            }
            Slot::Terminal { symbol, bits } => {
                out.push(symbol);
                node = 0;
                reservoir >>= bits;
                fill -= bits as u32;
            }
            Slot::Empty => return Err(Error::MalformedTable),
        }
    }
    Ok(out)
}

/// Decode one complete entropy-coded block.
///
/// The block prelude is a `u32` compressed byte count (carried by the
/// format but not needed here) and a `u64` output symbol count; the symbol
/// table and the packed bitstream follow.
pub fn decode_block(stream: &mut ByteStream<'_>) -> Result<Vec<i16>> {
    let _compressed_len = stream.read_u32_le()?;
    let symbol_count = stream.read_u64_le()?;
    let table = SymbolTable::read(stream)?;
    decode(stream, &table, symbol_count as usize)
}
