//! CLI entry point for mnn-bridge.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use ndarray::ArrayD;
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use mnn_bridge::cli::{parse_op, Cli, Commands};
use mnn_bridge::config::Config;
use mnn_bridge::reference::ModelBuilder;
use mnn_bridge::session::{SessionInfo, SessionInfoCode};
use mnn_bridge::{Engine, NativeApi, Tensor, TensorAccess};

/// Bind the built-in reference engine, or a shared library when given.
fn native_api(library: Option<&Path>) -> Result<Arc<NativeApi>> {
    match library {
        None => Ok(Arc::new(NativeApi::reference())),
        #[cfg(feature = "dynamic")]
        Some(path) => Ok(Arc::new(NativeApi::load(path).with_context(|| {
            format!("Failed to load library: {}", path.display())
        })?)),
        #[cfg(not(feature = "dynamic"))]
        Some(path) => anyhow::bail!(
            "cannot load {}: built without the `dynamic` feature",
            path.display()
        ),
    }
}

fn session_float(info: mnn_bridge::Result<SessionInfo>) -> Option<f32> {
    match info {
        Ok(SessionInfo::Memory(v)) | Ok(SessionInfo::Flops(v)) => Some(v),
        _ => None,
    }
}

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let cli = Cli::parse_args();

    match cli.command {
        Commands::Run {
            model,
            input,
            config,
            format,
            trace_ops,
        } => {
            let config = if let Some(config_path) = config {
                Config::from_yaml_file(&config_path)
                    .with_context(|| format!("Failed to load config: {}", config_path.display()))?
            } else {
                Config::default()
            };
            let model = model
                .or_else(|| config.model.path.clone())
                .context("No model given on the command line or in the config")?;

            let api = native_api(cli.library.as_deref())?;
            info!("Engine: {:?} {}", api.provider(), api.version());

            info!("Loading model: {}", model.display());
            let mut engine = Engine::from_file(api.clone(), &model)?;
            config.apply(&mut engine)?;
            let mut session = engine.create_session(&config.schedule_config())?;
            info!("Session created");

            // Expected format: { "data": [...], "shape": [B, C, H, W] }
            info!("Loading input: {}", input.display());
            let input_json: Value = serde_json::from_str(
                &fs::read_to_string(&input)
                    .with_context(|| format!("Failed to read input: {}", input.display()))?,
            )?;
            let data: Vec<f32> = input_json["data"]
                .as_array()
                .context("Input must have 'data' array")?
                .iter()
                .map(|v| v.as_f64().map(|f| f as f32).context("'data' must hold numbers"))
                .collect::<Result<_>>()?;
            let shape: Vec<usize> = input_json["shape"]
                .as_array()
                .context("Input must have 'shape' array")?
                .iter()
                .map(|v| v.as_u64().map(|d| d as usize).context("'shape' must hold sizes"))
                .collect::<Result<_>>()?;
            let array = ArrayD::from_shape_vec(ndarray::IxDyn(&shape), data)
                .context("Failed to create input tensor")?;

            let dims: Vec<i32> = shape.iter().map(|&d| d as i32).collect();
            if session.input(None)?.shape()? != dims {
                info!("Resizing input to {:?}", dims);
                session.resize_tensor(None, &dims)?;
            }
            session.bind_input(None, &Tensor::from_array(&api, &array)?)?;

            info!("Running inference...");
            let start = Instant::now();
            let mut trace = Vec::new();
            if trace_ops {
                session.run_with_callbacks_info(
                    |_, op| {
                        info!(op = %op.name(), kind = %op.type_name(), mflops = op.flops(), "operator");
                        trace.push(serde_json::json!({
                            "name": op.name(),
                            "type": op.type_name(),
                            "flops": op.flops(),
                        }));
                        true
                    },
                    |_, _| true,
                )?;
            } else {
                session.run()?;
            }
            let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

            if config.model.cache_file.is_some() {
                engine.update_cache_file(&session, 0)?;
            }

            let names: Vec<String> = session.outputs()?.into_iter().map(|(name, _)| name).collect();
            let mut outputs = Vec::new();
            for name in names {
                let host = session.read_output(Some(&name))?;
                let values = host.read_f32()?;
                outputs.push(serde_json::json!({
                    "name": name,
                    "shape": host.shape()?,
                    "numel": values.len(),
                    "head": values.iter().take(8).collect::<Vec<_>>(),
                }));
            }
            info!("Inference complete: {} outputs in {:.2}ms", outputs.len(), latency_ms);

            let mut output = serde_json::json!({
                "num_outputs": outputs.len(),
                "latency_ms": latency_ms,
                "memory_mb": session_float(session.info(SessionInfoCode::Memory)),
                "mflops": session_float(session.info(SessionInfoCode::Flops)),
                "outputs": outputs,
            });
            if trace_ops {
                output["ops"] = Value::Array(trace);
            }

            if format == "pretty" {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                println!("{}", serde_json::to_string(&output)?);
            }
        }

        Commands::Info { model } => {
            let api = native_api(cli.library.as_deref())?;

            println!("mnn-bridge v{}", env!("CARGO_PKG_VERSION"));
            println!("engine: {:?}", api.provider());
            println!("engine version: {}", api.version());
            println!();
            println!("Model: {}", model.display());

            info!("Loading model...");
            let engine = Engine::from_file(api, &model)?;
            println!("Model version: {}", engine.model_version()?);
            println!("Biz code: {}", engine.biz_code()?);
            println!("UUID: {}", engine.uuid()?);

            let session = engine.create_session(&Default::default())?;
            for (name, t) in session.inputs()? {
                println!("Input  {}: {:?} {}", name, t.shape()?, t.halide_type()?);
            }
            for (name, t) in session.outputs()? {
                println!("Output {}: {:?} {}", name, t.shape()?, t.halide_type()?);
            }
            println!("Status: OK (session created successfully)");
        }

        Commands::Fixture {
            output,
            inputs,
            outputs,
            ops,
        } => {
            let mut builder = ModelBuilder::new();
            for (name, dims) in &inputs {
                builder = builder.input(name.as_str(), dims);
            }
            for (name, dims) in &outputs {
                builder = builder.output(name.as_str(), dims);
            }
            for op in &ops {
                let (name, op_type, flops) = parse_op(op).map_err(anyhow::Error::msg)?;
                builder = builder.op(name, op_type, flops);
            }
            builder
                .write_to(&output)
                .with_context(|| format!("Failed to write model: {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
    }

    Ok(())
}
