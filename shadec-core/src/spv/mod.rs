//! Word-level SPIR-V: instruction encoding, module headers and a small
//! reader used to inspect emitted binaries.
use std::fmt;

use anyhow::{anyhow, bail, Result};
use num_traits::FromPrimitive;
use spirv::Op;

pub mod builder;

pub use self::builder::ModuleBuilder;

pub const MAGIC_NUMBER: u32 = 0x0723_0203;
/// SPIR-V 1.3, the newest version that still admits `BufferBlock`.
pub const VERSION: u32 = 0x0001_0300;

#[derive(Debug, Clone)]
pub struct SpirvHeader {
    pub magic: u32,
    pub version: u32,
    pub generator: u32,
    pub bound: u32,
    pub schema: u32,
}
impl Default for SpirvHeader {
    fn default() -> Self {
        SpirvHeader {
            magic: MAGIC_NUMBER,
            version: VERSION,
            generator: 0,
            bound: 0,
            schema: 0,
        }
    }
}
impl SpirvHeader {
    pub fn words(&self) -> [u32; 5] {
        [
            self.magic,
            self.version,
            self.generator,
            self.bound,
            self.schema,
        ]
    }
}

/// A single encoded instruction: the header word followed by operands.
#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    words: Vec<u32>,
}
impl Instruction {
    pub fn opcode(&self) -> u32 {
        self.words[0] & 0xFFFF
    }
    pub fn op(&self) -> Option<Op> {
        Op::from_u32(self.opcode())
    }
    /// Word count including the header word.
    pub fn word_count(&self) -> usize {
        self.words.len()
    }
    pub fn operands(&self) -> Operands<'_> {
        Operands(&self.words[1..])
    }
    pub fn words(&self) -> &[u32] {
        &self.words
    }
    pub fn into_words(self) -> Vec<u32> {
        self.words
    }
}
impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Some(op) => write!(f, "{:?} {:?}", op, &self.words[1..]),
            None => write!(f, "Op#{} {:?}", self.opcode(), &self.words[1..]),
        }
    }
}

pub struct InstructionBuilder {
    words: Vec<u32>,
}
impl InstructionBuilder {
    pub fn new(op: Op) -> InstructionBuilder {
        InstructionBuilder {
            words: vec![(op as u32) & 0xFFFF],
        }
    }
    pub fn push(mut self, x: u32) -> Self {
        self.words.push(x);
        self
    }
    pub fn push_list(mut self, x: &[u32]) -> Self {
        self.words.extend_from_slice(x);
        self
    }
    /// Push a string operand: UTF-8 bytes, null-terminated, padded out to
    /// a whole number of little-endian words.
    pub fn push_str(mut self, x: &str) -> Self {
        let mut bytes = x.as_bytes().to_vec();
        bytes.push(0);
        while bytes.len() % 4 != 0 {
            bytes.push(0);
        }
        for chunk in bytes.chunks_exact(4) {
            self.words
                .push(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        self
    }
    pub fn build(mut self) -> Instruction {
        self.words[0] |= (self.words.len() as u32) << 16;
        Instruction { words: self.words }
    }
}

/// A borrowed view of one instruction inside a word stream.
#[derive(Clone, Copy)]
pub struct Instr<'a> {
    words: &'a [u32],
}
impl<'a> Instr<'a> {
    pub fn opcode(&self) -> u32 {
        self.words[0] & 0xFFFF
    }
    pub fn op(&self) -> Option<Op> {
        Op::from_u32(self.opcode())
    }
    pub fn word_count(&self) -> usize {
        self.words.len()
    }
    pub fn operands(&self) -> Operands<'a> {
        Operands(&self.words[1..])
    }
}
impl<'a> fmt::Debug for Instr<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Some(op) => write!(f, "{:?} {:?}", op, &self.words[1..]),
            None => write!(f, "Op#{} {:?}", self.opcode(), &self.words[1..]),
        }
    }
}

/// Walks the instructions of an instruction stream.
pub struct Instrs<'a> {
    words: &'a [u32],
}
impl<'a> Instrs<'a> {
    pub fn new(words: &'a [u32]) -> Instrs<'a> {
        Instrs { words }
    }
}
impl<'a> Iterator for Instrs<'a> {
    type Item = Result<Instr<'a>>;
    fn next(&mut self) -> Option<Self::Item> {
        let head = *self.words.first()?;
        let len = (head >> 16) as usize;
        if len == 0 {
            self.words = &[];
            return Some(Err(anyhow!("instruction length is zero")));
        }
        if len > self.words.len() {
            self.words = &[];
            return Some(Err(anyhow!("instruction is truncated")));
        }
        let instr = Instr {
            words: &self.words[..len],
        };
        self.words = &self.words[len..];
        Some(Ok(instr))
    }
}

/// An operand reader over the tail of an instruction.
pub struct Operands<'a>(&'a [u32]);
impl<'a> Operands<'a> {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn as_slice(&self) -> &'a [u32] {
        self.0
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        if let Some(x) = self.0.first() {
            self.0 = &self.0[1..];
            Ok(*x)
        } else {
            Err(anyhow!("operand is too short"))
        }
    }
    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_u32().map(|x| x != 0)
    }
    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_u32().map(f32::from_bits)
    }
    pub fn read_id(&mut self) -> Result<u32> {
        self.read_u32()
    }
    pub fn read_enum<E: FromPrimitive>(&mut self) -> Result<E> {
        self.read_u32()
            .and_then(|x| FromPrimitive::from_u32(x).ok_or_else(|| anyhow!("invalid enum value")))
    }
    pub fn read_str(&mut self) -> Result<String> {
        if self.0.is_empty() {
            bail!("operand is too short");
        }
        let mut bytes = Vec::new();
        let mut nword = 0;
        'outer: for word in self.0 {
            nword += 1;
            for byte in word.to_le_bytes().iter() {
                if *byte == 0 {
                    break 'outer;
                }
                bytes.push(*byte);
            }
            if nword == self.0.len() {
                bail!("string is not null-terminated");
            }
        }
        self.0 = &self.0[nword..];
        String::from_utf8(bytes).map_err(|_| anyhow!("string is not valid utf-8"))
    }
    pub fn read_list(&mut self) -> Result<&'a [u32]> {
        let rv = self.0;
        self.0 = &[];
        Ok(rv)
    }
}

/// SPIR-V program binary.
#[derive(Debug, Default, Clone)]
pub struct SpirvBinary(Vec<u32>);
impl From<Vec<u32>> for SpirvBinary {
    fn from(x: Vec<u32>) -> Self {
        SpirvBinary(x)
    }
}
impl SpirvBinary {
    pub fn words(&self) -> &[u32] {
        &self.0
    }
    pub fn into_words(self) -> Vec<u32> {
        self.0
    }
    /// The raw little-endian byte image of the module.
    pub fn bytes(&self) -> Vec<u8> {
        self.0.iter().flat_map(|x| x.to_le_bytes().to_vec()).collect()
    }

    pub fn header(&self) -> Option<SpirvHeader> {
        if self.0.len() < 5 {
            return None;
        }
        Some(SpirvHeader {
            magic: self.0[0],
            version: self.0[1],
            generator: self.0[2],
            bound: self.0[3],
            schema: self.0[4],
        })
    }

    /// Walk the instructions after the 5-word header.
    pub fn instrs(&self) -> Result<Instrs> {
        if self.0.len() < 5 {
            bail!("missing header");
        }
        Ok(Instrs::new(&self.0[5..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_word_packs_count_and_opcode() {
        let instr = InstructionBuilder::new(Op::TypeInt).push(2).push(32).push(1).build();
        assert_eq!(instr.words()[0], (4 << 16) | (Op::TypeInt as u32));
        assert_eq!(instr.word_count(), 4);
    }

    #[test]
    fn string_operands_are_padded_and_terminated() {
        let instr = InstructionBuilder::new(Op::Name).push(1).push_str("main").build();
        // "main" + NUL fills five bytes, so two words.
        assert_eq!(instr.word_count(), 4);
        let mut operands = instr.operands();
        assert_eq!(operands.read_id().unwrap(), 1);
        assert_eq!(operands.read_str().unwrap(), "main");
    }

    #[test]
    fn instrs_walks_a_stream() {
        let mut words = Vec::new();
        words.extend_from_slice(InstructionBuilder::new(Op::TypeVoid).push(1).build().words());
        words.extend_from_slice(
            InstructionBuilder::new(Op::TypeFloat).push(2).push(32).build().words(),
        );
        let ops = Instrs::new(&words)
            .map(|i| i.unwrap().op().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(ops, vec![Op::TypeVoid, Op::TypeFloat]);
    }

    #[test]
    fn truncated_stream_reports_an_error() {
        let instr = InstructionBuilder::new(Op::TypeFloat).push(2).push(32).build();
        let words = &instr.words()[..2];
        let mut it = Instrs::new(words);
        assert!(it.next().unwrap().is_err());
    }
}
