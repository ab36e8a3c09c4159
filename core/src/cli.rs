//! Command-line interface for mnn-bridge.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Load and run MNN models through the C API.
#[derive(Parser, Debug)]
#[command(name = "mnn-bridge")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Shared MNN C library to load instead of the built-in reference
    /// engine (needs the `dynamic` feature).
    #[arg(short, long, global = true)]
    pub library: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print engine and model metadata.
    Info {
        /// Path to the model file.
        #[arg(short, long)]
        model: PathBuf,
    },

    /// Bind one input, run the model and report the outputs.
    Run {
        /// Path to the model file. Falls back to `model.path` in the config.
        #[arg(short, long)]
        model: Option<PathBuf>,

        /// Path to input data file (JSON: `{ "data": [...], "shape": [...] }`).
        #[arg(short, long)]
        input: PathBuf,

        /// Path to optional YAML config file.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format (json, pretty).
        #[arg(short, long, default_value = "json")]
        format: String,

        /// Report every operator as it executes.
        #[arg(long)]
        trace_ops: bool,
    },

    /// Write a reference-engine model file.
    Fixture {
        /// Destination file.
        #[arg(short, long)]
        output: PathBuf,

        /// Input tensor as name=shape, e.g. data=1,3,224,224.
        #[arg(long = "input", value_parser = parse_tensor_spec, required = true)]
        inputs: Vec<(String, Vec<i32>)>,

        /// Output tensor as name=shape.
        #[arg(long = "output-tensor", value_parser = parse_tensor_spec, required = true)]
        outputs: Vec<(String, Vec<i32>)>,

        /// Operator as name:type[:mflops].
        #[arg(long = "op")]
        ops: Vec<String>,
    },
}

impl Cli {
    /// Parse command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

/// Parse a comma separated shape like `1,3,224,224`.
pub fn parse_shape(s: &str) -> Result<Vec<i32>, String> {
    s.split(',')
        .map(|d| {
            d.trim()
                .parse::<i32>()
                .ok()
                .filter(|&d| d >= 0)
                .ok_or_else(|| format!("invalid extent '{}' in shape '{}'", d, s))
        })
        .collect()
}

fn parse_tensor_spec(s: &str) -> Result<(String, Vec<i32>), String> {
    let (name, shape) = s
        .split_once('=')
        .ok_or_else(|| format!("expected name=shape, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("missing tensor name in '{}'", s));
    }
    Ok((name.to_string(), parse_shape(shape)?))
}

/// Parse an operator spec `name:type[:mflops]`.
pub fn parse_op(s: &str) -> Result<(String, String, f32), String> {
    let mut parts = s.splitn(3, ':');
    let (Some(name), Some(op_type)) = (parts.next(), parts.next()) else {
        return Err(format!("expected name:type[:mflops], got '{}'", s));
    };
    let flops = match parts.next() {
        Some(f) => f.parse().map_err(|_| format!("invalid flops '{}'", f))?,
        None => 0.0,
    };
    Ok((name.to_string(), op_type.to_string(), flops))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shapes_and_specs_parse() {
        assert_eq!(parse_shape("1, 3,224,224").unwrap(), vec![1, 3, 224, 224]);
        assert!(parse_shape("1,-3").is_err());
        assert!(parse_shape("1,x").is_err());
        assert_eq!(
            parse_tensor_spec("data=1,2").unwrap(),
            ("data".to_string(), vec![1, 2])
        );
        assert!(parse_tensor_spec("=1").is_err());
        assert_eq!(
            parse_op("conv1:Convolution:118").unwrap(),
            ("conv1".into(), "Convolution".into(), 118.0)
        );
        assert_eq!(parse_op("relu:ReLU").unwrap().2, 0.0);
        assert!(parse_op("relu").is_err());
    }

    #[test]
    fn run_command_parses() {
        let cli = Cli::try_parse_from([
            "mnn-bridge", "run", "-m", "m.mnn", "-i", "in.json", "--trace-ops",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                trace_ops, format, ..
            } => {
                assert!(trace_ops);
                assert_eq!(format, "json");
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
