//! The reference engine's model container.
//!
//! Little endian throughout. Strings are a `u32` byte length followed by
//! UTF-8. Layout:
//!
//! ```text
//! "MNNR" | version u32 | biz_code str | uuid str | latency_ms u32
//! inputs:  count u32, then { name str, rank u32, dims i32 * rank }
//! outputs: count u32, then { name str, rank u32, dims i32 * rank }
//! ops:     count u32, then { name str, type str, flops f32 }
//! ```

use std::path::Path;
use std::time::Duration;

use crate::error::{BridgeError, Result};

pub const MAGIC: &[u8; 4] = b"MNNR";
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct IoSpec {
    pub name: String,
    pub dims: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpSpec {
    pub name: String,
    pub op_type: String,
    pub flops: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    pub version: u32,
    pub biz_code: String,
    pub uuid: String,
    pub latency: Duration,
    pub inputs: Vec<IoSpec>,
    pub outputs: Vec<IoSpec>,
    pub ops: Vec<OpSpec>,
}

impl Model {
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, String> {
        let mut r = Reader { bytes, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err("bad magic".into());
        }
        let version = r.u32()?;
        if version != FORMAT_VERSION {
            return Err(format!("unsupported format version {}", version));
        }
        let biz_code = r.string()?;
        let uuid = r.string()?;
        let latency = Duration::from_millis(r.u32()? as u64);
        let inputs = r.io_specs()?;
        let outputs = r.io_specs()?;
        let op_count = r.u32()?;
        let mut ops = Vec::new();
        for _ in 0..op_count {
            ops.push(OpSpec {
                name: r.string()?,
                op_type: r.string()?,
                flops: f32::from_le_bytes(r.array()?),
            });
        }
        if r.pos != bytes.len() {
            return Err(format!("{} trailing bytes", bytes.len() - r.pos));
        }
        if inputs.is_empty() || outputs.is_empty() {
            return Err("model needs at least one input and one output".into());
        }
        Ok(Self {
            version,
            biz_code,
            uuid,
            latency,
            inputs,
            outputs,
            ops,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        put_str(&mut out, &self.biz_code);
        put_str(&mut out, &self.uuid);
        out.extend_from_slice(&(self.latency.as_millis() as u32).to_le_bytes());
        for specs in [&self.inputs, &self.outputs] {
            out.extend_from_slice(&(specs.len() as u32).to_le_bytes());
            for spec in specs.iter() {
                put_str(&mut out, &spec.name);
                out.extend_from_slice(&(spec.dims.len() as u32).to_le_bytes());
                for d in &spec.dims {
                    out.extend_from_slice(&d.to_le_bytes());
                }
            }
        }
        out.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
        for op in &self.ops {
            put_str(&mut out, &op.name);
            put_str(&mut out, &op.op_type);
            out.extend_from_slice(&op.flops.to_le_bytes());
        }
        out
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> std::result::Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> std::result::Result<String, String> {
        let len = self.u32()? as usize;
        String::from_utf8(self.take(len)?.to_vec()).map_err(|e| e.to_string())
    }

    fn io_specs(&mut self) -> std::result::Result<Vec<IoSpec>, String> {
        let count = self.u32()?;
        let mut specs = Vec::new();
        for _ in 0..count {
            let name = self.string()?;
            let rank = self.u32()?;
            let mut dims = Vec::new();
            for _ in 0..rank {
                let d = i32::from_le_bytes(self.array()?);
                if d < 0 {
                    return Err(format!("negative extent in {}", name));
                }
                dims.push(d);
            }
            specs.push(IoSpec { name, dims });
        }
        Ok(specs)
    }
}

/// Assembles reference models for tests and the `fixture` command.
///
/// ```
/// use mnn_bridge::reference::ModelBuilder;
///
/// let bytes = ModelBuilder::new()
///     .input("data", &[1, 3, 224, 224])
///     .output("prob", &[1, 1000])
///     .op("conv1", "Convolution", 118.0)
///     .build();
/// assert_eq!(&bytes[..4], b"MNNR");
/// ```
#[derive(Debug, Clone)]
pub struct ModelBuilder {
    model: Model,
}

impl Default for ModelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelBuilder {
    pub fn new() -> Self {
        Self {
            model: Model {
                version: FORMAT_VERSION,
                biz_code: "reference".into(),
                uuid: "00000000-0000-0000-0000-000000000000".into(),
                latency: Duration::ZERO,
                inputs: Vec::new(),
                outputs: Vec::new(),
                ops: Vec::new(),
            },
        }
    }

    pub fn biz_code(mut self, code: impl Into<String>) -> Self {
        self.model.biz_code = code.into();
        self
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.model.uuid = uuid.into();
        self
    }

    /// Simulated execution time of one run.
    pub fn latency(mut self, latency: Duration) -> Self {
        self.model.latency = latency;
        self
    }

    pub fn input(mut self, name: impl Into<String>, dims: &[i32]) -> Self {
        self.model.inputs.push(IoSpec {
            name: name.into(),
            dims: dims.to_vec(),
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>, dims: &[i32]) -> Self {
        self.model.outputs.push(IoSpec {
            name: name.into(),
            dims: dims.to_vec(),
        });
        self
    }

    pub fn op(mut self, name: impl Into<String>, op_type: impl Into<String>, flops: f32) -> Self {
        self.model.ops.push(OpSpec {
            name: name.into(),
            op_type: op_type.into(),
            flops,
        });
        self
    }

    pub fn build(&self) -> Vec<u8> {
        self.model.encode()
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, self.build()).map_err(BridgeError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ModelBuilder {
        ModelBuilder::new()
            .biz_code("classify")
            .uuid("c0ffee")
            .latency(Duration::from_millis(5))
            .input("data", &[1, 3, 224, 224])
            .output("prob", &[1, 1000])
            .op("conv1", "Convolution", 118.0)
            .op("fc", "InnerProduct", 2.0)
    }

    #[test]
    fn decodes_what_builder_writes() {
        let model = Model::decode(&classifier().build()).unwrap();
        assert_eq!(model.biz_code, "classify");
        assert_eq!(model.latency, Duration::from_millis(5));
        assert_eq!(model.inputs[0].dims, vec![1, 3, 224, 224]);
        assert_eq!(model.outputs[0].name, "prob");
        assert_eq!(model.ops.len(), 2);
        assert_eq!(model.ops[1].op_type, "InnerProduct");
    }

    #[test]
    fn rejects_truncated_and_foreign_buffers() {
        let bytes = classifier().build();
        for cut in [0, 3, 4, 10, bytes.len() - 1] {
            assert!(Model::decode(&bytes[..cut]).is_err(), "cut at {}", cut);
        }
        let mut foreign = bytes.clone();
        foreign[0] = b'X';
        assert!(Model::decode(&foreign).is_err());
        let mut padded = bytes;
        padded.push(0);
        assert!(Model::decode(&padded).is_err());
    }

    #[test]
    fn requires_inputs_and_outputs() {
        let bytes = ModelBuilder::new().input("x", &[1]).build();
        assert!(Model::decode(&bytes).is_err());
    }
}
