use anyhow::Result;
use mnn_bridge::buffer::{self, BufferDescriptor, Dimension, HalideType};
use mnn_bridge::config::Config;
use mnn_bridge::engine::{HintMode, SessionMode};
use mnn_bridge::marshal;
use mnn_bridge::pin;
use mnn_bridge::schedule::{BackendConfig, SchedulePath};
use mnn_bridge::{BridgeError, Engine, ScheduleConfig};

mod common;

#[test]
fn failed_session_creation_releases_everything() -> Result<()> {
    let engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    let (pins, arrays) = (pin::active_pins(), marshal::live_allocations());

    let config = ScheduleConfig {
        save_tensors: vec!["conv1".into(), "relu1".into()],
        path: SchedulePath {
            inputs: vec!["data".into()],
            outputs: vec!["prob".into()],
            ..SchedulePath::default()
        },
        ..ScheduleConfig::default()
    }
    .with_threads(-1)
    .with_backend(BackendConfig::default());

    assert!(matches!(
        engine.create_session(&config),
        Err(BridgeError::NativeCreation(_))
    ));
    assert_eq!(pin::active_pins(), pins);
    assert_eq!(marshal::live_allocations(), arrays);

    let session = engine.create_session(&config.with_threads(2))?;
    assert_eq!(pin::active_pins(), pins);
    assert_eq!(marshal::live_allocations(), arrays);
    drop(session);
    Ok(())
}

#[test]
fn buffers_free_their_memory() -> Result<()> {
    let before = buffer::live_allocations();
    {
        let mut desc = BufferDescriptor::new(2, &Dimension::dense(&[2, 3])?, HalideType::f32(), true)?;
        assert!(desc.owns_host());
        assert_eq!(desc.byte_size()?, 24);
        assert!(buffer::live_allocations() > before);
        desc.destroy();
        desc.destroy();
        assert!(desc.is_destroyed());
        assert_eq!(buffer::live_allocations(), before);
    }
    {
        let _desc = BufferDescriptor::new(1, &Dimension::dense(&[16])?, HalideType::u8(), true)?;
    }
    assert_eq!(buffer::live_allocations(), before);
    Ok(())
}

#[test]
fn cache_file_is_written_for_a_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let cache = dir.path().join("tune.cache");

    let mut engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    assert!(!engine.is_configured());
    engine.set_session_mode(SessionMode::Debug)?;
    engine.set_session_hint(HintMode::MaxTuningNumber, 10)?;
    engine.set_session_hint_array(HintMode::CpuCoreIds, &[0, 1])?;
    engine.set_cache_file(&cache, 8)?;
    assert!(engine.is_configured());

    let session = engine.create_session(&ScheduleConfig::default())?;
    engine.update_cache_file(&session, 0)?;
    let written = std::fs::read(&cache)?;
    assert!(written.starts_with(b"5f1c2a9e"));
    Ok(())
}

#[test]
fn cache_update_without_cache_file_fails() -> Result<()> {
    let engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    let session = engine.create_session(&ScheduleConfig::default())?;
    assert!(matches!(
        engine.update_cache_file(&session, 0),
        Err(BridgeError::EngineRun { .. })
    ));
    Ok(())
}

#[test]
fn config_file_drives_engine_and_session() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config_path = dir.path().join("bridge.yaml");
    let cache = dir.path().join("model.cache");
    std::fs::write(
        &config_path,
        format!(
            "model:\n  cache_file: {}\nschedule:\n  num_threads: 3\n",
            cache.display()
        ),
    )?;
    let config = Config::from_yaml_file(&config_path)?;

    let mut engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    config.apply(&mut engine)?;
    let mut session = engine.create_session(&config.schedule_config())?;
    session.run()?;
    engine.update_cache_file(&session, 1)?;
    assert!(cache.exists());
    Ok(())
}

#[test]
fn missing_external_file_blocks_sessions() -> Result<()> {
    let mut engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    engine.set_external_file("/nonexistent/weights.bin", 0)?;
    assert!(matches!(
        engine.create_session(&ScheduleConfig::default()),
        Err(BridgeError::NativeCreation(_))
    ));
    Ok(())
}

#[test]
fn released_model_keeps_existing_sessions() -> Result<()> {
    let engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;
    engine.release_model()?;

    session.run()?;
    assert!(matches!(
        engine.create_session(&ScheduleConfig::default()),
        Err(BridgeError::NativeCreation(_))
    ));
    Ok(())
}

#[test]
fn released_engine_rejects_calls() -> Result<()> {
    let mut engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    engine.release();
    engine.release();
    assert!(!engine.is_valid());
    assert!(matches!(
        engine.create_session(&ScheduleConfig::default()),
        Err(BridgeError::InvalidHandle("interpreter"))
    ));
    Ok(())
}
