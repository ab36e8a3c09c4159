use std::cell::RefCell;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use approx::assert_abs_diff_eq;
use mnn_bridge::tensor::DimensionType;
use mnn_bridge::{BridgeError, Engine, ErrorCode, ScheduleConfig, Tensor, TensorAccess};

mod common;

fn bound_engine() -> Result<Engine> {
    Ok(Engine::from_buffer(
        common::api(),
        &common::slow_model(Duration::ZERO).build(),
    )?)
}

fn bind(session: &mut mnn_bridge::Session<'_>, values: &[f32; 4]) -> Result<()> {
    let host = Tensor::host_from_f32(session.engine().api(), &[1, 4], values, DimensionType::Caffe)?;
    session.bind_input(None, &host)?;
    Ok(())
}

#[test]
fn hooks_fire_in_operator_order() -> Result<()> {
    let engine = bound_engine()?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;
    bind(&mut session, &[1.0, 2.0, 3.0, 6.0])?;

    let events = RefCell::new(Vec::new());
    session.run_with_callbacks(
        |tensors, name| {
            assert_eq!(tensors.len(), 1);
            events.borrow_mut().push(format!("before {}", name));
            true
        },
        |tensors, name| {
            assert_eq!(tensors[0].shape().unwrap(), vec![1, 2]);
            events.borrow_mut().push(format!("after {}", name));
            true
        },
    )?;
    assert_eq!(
        events.into_inner(),
        vec!["before a", "after a", "before b", "after b"]
    );
    assert_eq!(session.read_output(None)?.read_f32()?, vec![3.0, 3.0]);
    Ok(())
}

#[test]
fn before_false_skips_and_after_false_stops() -> Result<()> {
    let engine = bound_engine()?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;
    bind(&mut session, &[1.0; 4])?;

    let mut after_calls = Vec::new();
    session.run_with_callbacks(
        |_, name| name != "a",
        |_, name| {
            after_calls.push(name.to_string());
            true
        },
    )?;
    assert_eq!(after_calls, vec!["b"]);

    let err = session
        .run_with_callbacks(|_, _| true, |_, name| name != "a")
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::EngineRun {
            code: ErrorCode::CallBackStop,
            ..
        }
    ));
    Ok(())
}

#[test]
fn info_hooks_see_operator_details() -> Result<()> {
    let engine = Engine::from_buffer(common::api(), &common::classifier().build())?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;

    let mut seen = Vec::new();
    session.run_with_callbacks_info(
        |_, op| {
            seen.push((op.name(), op.type_name(), op.flops()));
            true
        },
        |_, _| true,
    )?;
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].0, "conv1");
    assert_eq!(seen[0].1, "Convolution");
    assert_abs_diff_eq!(seen[0].2, 118.0);
    assert_eq!(seen[2].1, "InnerProduct");
    Ok(())
}

#[test]
fn panicking_hook_stops_the_run() -> Result<()> {
    let engine = bound_engine()?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;
    let err = session
        .run_with_callbacks(|_, _| true, |_, _| panic!("hook failure"))
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::EngineRun {
            code: ErrorCode::CallBackStop,
            ..
        }
    ));

    // The session stays usable.
    session.run()?;
    Ok(())
}

#[test]
fn async_run_completes_in_background() -> Result<()> {
    let latency = Duration::from_millis(200);
    let engine = Engine::from_buffer(common::api(), &common::slow_model(latency).build())?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;
    bind(&mut session, &[2.0; 4])?;
    session.run()?;
    bind(&mut session, &[4.0; 4])?;

    let events = Arc::new(Mutex::new(Vec::new()));
    let (before_log, after_log) = (Arc::clone(&events), Arc::clone(&events));
    let start = Instant::now();
    let pending = session.run_with_callbacks_async(
        move |_, name| {
            before_log.lock().unwrap().push(format!("before {}", name));
            true
        },
        move |_, name| {
            after_log.lock().unwrap().push(format!("after {}", name));
            true
        },
    )?;
    assert!(start.elapsed() < latency);
    assert!(!pending.is_complete()?);
    pending.wait()?;
    assert!(start.elapsed() >= latency);

    assert_eq!(events.lock().unwrap().len(), 4);
    assert_eq!(session.read_output(None)?.read_f32()?, vec![4.0, 4.0]);
    Ok(())
}

#[test]
fn dropping_a_pending_run_waits_for_it() -> Result<()> {
    let latency = Duration::from_millis(50);
    let engine = Engine::from_buffer(common::api(), &common::slow_model(latency).build())?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;

    let ops = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&ops);
    let start = Instant::now();
    {
        let _pending = session.run_with_callbacks_info_async(
            move |_, _| {
                *counter.lock().unwrap() += 1;
                true
            },
            |_, _| true,
        )?;
    }
    assert!(start.elapsed() >= latency);
    assert_eq!(*ops.lock().unwrap(), 2);
    assert!(session.output(None)?.is_ready()?);
    Ok(())
}

#[test]
fn stopped_async_run_reports_the_stop() -> Result<()> {
    let engine = Engine::from_buffer(
        common::api(),
        &common::slow_model(Duration::from_millis(20)).build(),
    )?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;

    let err = session
        .run_with_callbacks_async(|_, _| true, |_, _| false)?
        .wait()
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::EngineRun {
            code: ErrorCode::CallBackStop,
            ..
        }
    ));

    // A later run clears the stop.
    session
        .run_with_callbacks_async(|_, _| true, |_, _| true)?
        .wait()?;
    assert!(session.output(None)?.is_ready()?);
    Ok(())
}

#[test]
fn panicking_async_hook_fails_the_wait() -> Result<()> {
    let engine = bound_engine()?;
    let mut session = engine.create_session(&ScheduleConfig::default())?;

    let pending = session.run_with_callbacks_info_async(|_, _| true, |_, _| panic!("hook failure"))?;
    let err = pending.wait().unwrap_err();
    assert!(matches!(
        err,
        BridgeError::EngineRun {
            code: ErrorCode::CallBackStop,
            ..
        }
    ));

    session.run()?;
    Ok(())
}
