//! Model file reader and writer.
//!
//! Layout (little-endian):
//! 1. `magic: u32`, then `i32` header fields `n_vocab, n_embd, n_mult,
//!    n_head, n_layer, n_rot, ftype, is_multi_query, multi_query_group_num`.
//! 2. `n_vocab` vocabulary records `(len: i32, bytes[len], score: f32)`.
//! 3. Tensor records until EOF: `(n_dims, name_len, dtype_code: i32,
//!    shape[n_dims]: i32, name, payload)`.

use inferforge_kernels::DType;
use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::config::{convert_dtype, dtype_code, LlmParams};
use crate::error::{LlmError, Result};
use crate::vocab::{Token, Vocab};

pub const MODEL_MAGIC: u32 = 0x0123456;

const MAX_DIMS: usize = 4;

#[derive(Debug, Clone)]
pub struct TensorRecord {
    pub name: String,
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

fn truncated(what: &str) -> impl FnOnce(std::io::Error) -> LlmError + '_ {
    move |err| match err.kind() {
        ErrorKind::UnexpectedEof => LlmError::Load(format!("file truncated inside {}", what)),
        _ => LlmError::Io(err),
    }
}

fn non_negative(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| LlmError::Load(format!("negative {}: {}", what, value)))
}

pub struct ModelReader<R: Read> {
    reader: R,
    params: LlmParams,
    vocab: Vocab,
}

impl ModelReader<BufReader<File>> {
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: Read> ModelReader<R> {
    /// Parse the header and vocabulary. Tensors are streamed by
    /// [`next_tensor`](Self::next_tensor).
    pub fn new(mut reader: R) -> Result<Self> {
        let mut word = [0u8; 4];
        reader.read_exact(&mut word).map_err(truncated("header"))?;
        let magic = u32::from_le_bytes(word);
        if magic != MODEL_MAGIC {
            return Err(LlmError::Load(format!(
                "bad magic {:#x}, expected {:#x}",
                magic, MODEL_MAGIC
            )));
        }

        let mut fields = [0i32; 9];
        for field in &mut fields {
            *field = read_i32(&mut reader, "header")?;
        }
        let [n_vocab, n_embd, n_mult, n_head, n_layer, n_rot, ftype, multi_query, group] = fields;
        let params = LlmParams {
            n_vocab: non_negative(n_vocab, "n_vocab")?,
            n_embd: non_negative(n_embd, "n_embd")?,
            n_mult: non_negative(n_mult, "n_mult")?,
            n_head: non_negative(n_head, "n_head")?,
            n_layer: non_negative(n_layer, "n_layer")?,
            n_rot: non_negative(n_rot, "n_rot")?,
            ftype,
            n_ctx: 0,
            is_multi_query: multi_query != 0,
            multi_query_group_num: non_negative(group, "multi_query_group_num")?,
        };

        let mut vocab = Vocab::default();
        for _ in 0..params.n_vocab {
            let len = non_negative(read_i32(&mut reader, "vocabulary")?, "piece length")?;
            let piece = read_bytes(&mut reader, len, "vocabulary")?;
            let score = f32::from_bits(read_i32(&mut reader, "vocabulary")? as u32);
            vocab.push(piece, score);
        }

        Ok(Self { reader, params, vocab })
    }

    /// Header parameters. `n_ctx` is left at zero for the caller to fill.
    pub fn params(&self) -> &LlmParams {
        &self.params
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn into_vocab(self) -> Vocab {
        self.vocab
    }

    /// Next tensor record, or `None` at a clean end of file.
    pub fn next_tensor(&mut self) -> Result<Option<TensorRecord>> {
        let mut word = [0u8; 4];
        let mut filled = 0;
        while filled < word.len() {
            match self.reader.read(&mut word[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        match filled {
            0 => return Ok(None),
            4 => {}
            _ => return Err(LlmError::Load("file truncated inside tensor record".to_string())),
        }

        let n_dims = non_negative(i32::from_le_bytes(word), "n_dims")?;
        if n_dims == 0 || n_dims > MAX_DIMS {
            return Err(LlmError::Load(format!("tensor record with {} dims", n_dims)));
        }
        let name_len = non_negative(read_i32(&mut self.reader, "tensor record")?, "name length")?;
        let dtype = convert_dtype(read_i32(&mut self.reader, "tensor record")?)?;
        let shape = (0..n_dims)
            .map(|_| non_negative(read_i32(&mut self.reader, "tensor record")?, "dim"))
            .collect::<Result<Vec<_>>>()?;

        let name = read_bytes(&mut self.reader, name_len, "tensor name")?;
        let name = String::from_utf8(name)
            .map_err(|_| LlmError::Load("tensor name is not utf-8".to_string()))?;

        let len = dtype
            .storage_bytes(&shape)
            .map_err(|err| LlmError::Load(format!("tensor `{}`: {}", name, err)))?;
        let data = read_bytes(&mut self.reader, len, "tensor payload")?;

        Ok(Some(TensorRecord { name, dtype, shape, data }))
    }
}

fn read_i32(reader: &mut impl Read, what: &str) -> Result<i32> {
    let mut word = [0u8; 4];
    reader.read_exact(&mut word).map_err(truncated(what))?;
    Ok(i32::from_le_bytes(word))
}

/// Read exactly `len` bytes without trusting `len` for the allocation, so a
/// corrupt length fails at EOF instead of exhausting memory.
fn read_bytes(reader: &mut impl Read, len: usize, what: &str) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let want = u64::try_from(len).map_err(|_| LlmError::Load(format!("{} length {} too large", what, len)))?;
    reader.take(want).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(LlmError::Load(format!(
            "file truncated inside {}: expected {} bytes, found {}",
            what,
            len,
            buf.len()
        )));
    }
    Ok(buf)
}

fn to_i32(value: usize, what: &str) -> Result<i32> {
    i32::try_from(value).map_err(|_| LlmError::Config(format!("{} {} does not fit in i32", what, value)))
}

pub struct ModelWriter<W: Write> {
    writer: W,
}

impl ModelWriter<BufWriter<File>> {
    pub fn create_path(path: impl AsRef<Path>, params: &LlmParams, vocab: &Vocab) -> Result<Self> {
        Self::new(BufWriter::new(File::create(path)?), params, vocab)
    }
}

impl<W: Write> ModelWriter<W> {
    /// Write the header and vocabulary.
    pub fn new(mut writer: W, params: &LlmParams, vocab: &Vocab) -> Result<Self> {
        if vocab.len() != params.n_vocab {
            return Err(LlmError::Config(format!(
                "vocabulary has {} pieces, header says {}",
                vocab.len(),
                params.n_vocab
            )));
        }
        writer.write_all(&MODEL_MAGIC.to_le_bytes())?;
        let fields = [
            to_i32(params.n_vocab, "n_vocab")?,
            to_i32(params.n_embd, "n_embd")?,
            to_i32(params.n_mult, "n_mult")?,
            to_i32(params.n_head, "n_head")?,
            to_i32(params.n_layer, "n_layer")?,
            to_i32(params.n_rot, "n_rot")?,
            params.ftype,
            i32::from(params.is_multi_query),
            to_i32(params.multi_query_group_num, "multi_query_group_num")?,
        ];
        for field in fields {
            writer.write_all(&field.to_le_bytes())?;
        }
        for Token { piece, score } in vocab.tokens() {
            writer.write_all(&to_i32(piece.len(), "piece length")?.to_le_bytes())?;
            writer.write_all(piece)?;
            writer.write_all(&score.to_le_bytes())?;
        }
        Ok(Self { writer })
    }

    pub fn write_tensor(&mut self, name: &str, dtype: DType, shape: &[usize], data: &[u8]) -> Result<()> {
        let expected = dtype.storage_bytes(shape)?;
        if expected != data.len() {
            return Err(LlmError::Shape(format!(
                "tensor `{}` {:?} {:?} needs {} bytes, got {}",
                name,
                dtype,
                shape,
                expected,
                data.len()
            )));
        }
        let header = [
            to_i32(shape.len(), "n_dims")?,
            to_i32(name.len(), "name length")?,
            dtype_code(dtype)?,
        ];
        for field in header {
            self.writer.write_all(&field.to_le_bytes())?;
        }
        for &dim in shape {
            self.writer.write_all(&to_i32(dim, "dim")?.to_le_bytes())?;
        }
        self.writer.write_all(name.as_bytes())?;
        self.writer.write_all(data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn tiny_file(tensors: &[(&str, Vec<usize>, Vec<f32>)]) -> Vec<u8> {
        let params = LlmParams { n_vocab: 2, ..LlmParams::tiny() };
        let vocab = Vocab::new([
            Token { piece: b"a".to_vec(), score: 0.5 },
            Token { piece: b"bc".to_vec(), score: -1.0 },
        ]);
        let mut writer = ModelWriter::new(Vec::new(), &params, &vocab).expect("header");
        for (name, shape, data) in tensors {
            writer
                .write_tensor(name, DType::F32, shape, bytemuck::cast_slice(data))
                .expect("tensor");
        }
        writer.finish().expect("finish")
    }

    #[test]
    fn reads_back_what_was_written() {
        let bytes = tiny_file(&[("norm.weight", vec![2], vec![1.0, 2.0])]);
        let mut reader = ModelReader::new(Cursor::new(bytes)).expect("open");
        assert_eq!(reader.params().n_embd, 64);
        assert_eq!(reader.params().n_ctx, 0);
        assert_eq!(reader.vocab().token(1).map(|t| t.score), Some(-1.0));

        let record = reader.next_tensor().expect("record").expect("some");
        assert_eq!(record.name, "norm.weight");
        assert_eq!(record.shape, vec![2]);
        assert_eq!(record.data.len(), 8);
        assert!(reader.next_tensor().expect("eof").is_none());
    }

    #[test]
    fn bad_magic_is_load_error() {
        let mut bytes = tiny_file(&[]);
        bytes[0] ^= 0xff;
        assert!(matches!(ModelReader::new(Cursor::new(bytes)), Err(LlmError::Load(_))));
    }

    #[test]
    fn truncated_payload_is_load_error() {
        let mut bytes = tiny_file(&[("norm.weight", vec![4], vec![1.0; 4])]);
        bytes.truncate(bytes.len() - 3);
        let mut reader = ModelReader::new(Cursor::new(bytes)).expect("open");
        assert!(matches!(reader.next_tensor(), Err(LlmError::Load(_))));
    }

    #[test]
    fn partial_record_header_is_load_error() {
        let mut bytes = tiny_file(&[]);
        bytes.extend_from_slice(&[1, 0]);
        let mut reader = ModelReader::new(Cursor::new(bytes)).expect("open");
        assert!(matches!(reader.next_tensor(), Err(LlmError::Load(_))));
    }

    #[test]
    fn unknown_dtype_code_is_config_error() {
        let mut bytes = tiny_file(&[]);
        for field in [1i32, 1, 9, 2] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        let mut reader = ModelReader::new(Cursor::new(bytes)).expect("open");
        assert!(matches!(reader.next_tensor(), Err(LlmError::Config(_))));
    }

    fn record_header(n_dims: i32, name_len: i32, dtype: i32, shape: &[i32]) -> Vec<u8> {
        let mut bytes = tiny_file(&[]);
        for field in [n_dims, name_len, dtype].iter().chain(shape) {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn overflowing_shape_is_load_error() {
        let mut bytes = record_header(4, 1, 0, &[65536; 4]);
        bytes.push(b'w');
        let mut reader = ModelReader::new(Cursor::new(bytes)).expect("open");
        match reader.next_tensor() {
            Err(LlmError::Load(msg)) => assert!(msg.contains("overflows"), "{msg}"),
            other => panic!("expected a load error, got {:?}", other.map(|r| r.map(|t| t.name))),
        }
    }

    #[test]
    fn huge_claimed_payload_hits_eof_not_the_allocator() {
        let mut bytes = record_header(2, 1, 0, &[1 << 30, 1 << 30]);
        bytes.push(b'w');
        let mut reader = ModelReader::new(Cursor::new(bytes)).expect("open");
        assert!(matches!(reader.next_tensor(), Err(LlmError::Load(_))));

        let mut bytes = record_header(1, i32::MAX, 0, &[4]);
        bytes.extend_from_slice(b"abc");
        let mut reader = ModelReader::new(Cursor::new(bytes)).expect("open");
        assert!(matches!(reader.next_tensor(), Err(LlmError::Load(_))));
    }

    #[test]
    fn huge_vocab_piece_is_load_error() {
        let mut bytes = tiny_file(&[]);
        // header is magic + 9 fields; the first piece length follows it
        bytes.truncate(40);
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"ab");
        assert!(matches!(ModelReader::new(Cursor::new(bytes)), Err(LlmError::Load(_))));
    }

    #[test]
    fn file_round_trip() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("model.bin");
        let params = LlmParams { n_vocab: 1, ..LlmParams::tiny() };
        let vocab = Vocab::new([Token { piece: b"x".to_vec(), score: 0.0 }]);
        let mut writer = ModelWriter::create_path(&path, &params, &vocab)?;
        writer.write_tensor("t", DType::F16, &[2], &[0, 60, 0, 60])?;
        writer.finish()?;

        let mut reader = ModelReader::open_path(&path)?;
        let record = reader.next_tensor()?.expect("one tensor");
        assert_eq!(record.dtype, DType::F16);
        Ok(())
    }
}
