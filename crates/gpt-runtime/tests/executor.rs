mod common;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use gpt_runtime::models::{
    CONTEXT_LENGTHS, HOST_REQUEST_TYPES, INPUT_IDS, LOGITS, PAST_KEY_VALUE_LENGTHS,
    past_key_value,
};
use gpt_runtime::runtime::Stream;
use gpt_runtime::{ErrorCategory, RuntimeError, RuntimeExecutor, error_category};

use common::{IDENTITY_VOCAB, identity_config, identity_engine, init_tracing, profile};

fn executor() -> Result<RuntimeExecutor> {
    let engine = identity_engine(identity_config(false, false, 64)?, profile(2, 1, 8, 16))?;
    RuntimeExecutor::from_engine(&engine, &Stream::new(&Device::Cpu))
}

fn runtime_error(err: &anyhow::Error) -> Option<&RuntimeError> {
    err.downcast_ref::<RuntimeError>()
}

#[test]
fn test_binding_errors_are_typed() -> Result<()> {
    init_tracing();
    let dev = Device::Cpu;
    let mut exec = executor()?;

    let err = exec
        .set_binding("no_such_input", &Tensor::zeros(1, DType::U32, &dev)?)
        .unwrap_err();
    assert!(matches!(runtime_error(&err), Some(RuntimeError::UnknownBinding(_))));
    assert_eq!(error_category(&err), Some(ErrorCategory::Configuration));

    let err = exec
        .set_binding(INPUT_IDS, &Tensor::zeros((1, 4), DType::F32, &dev)?)
        .unwrap_err();
    assert!(matches!(runtime_error(&err), Some(RuntimeError::KindMismatch(_))));

    let err = exec
        .set_binding(INPUT_IDS, &Tensor::zeros((1, 9), DType::U32, &dev)?)
        .unwrap_err();
    assert!(matches!(
        runtime_error(&err),
        Some(RuntimeError::ShapeUnsupported { .. })
    ));
    assert_eq!(error_category(&err), Some(ErrorCategory::Capacity));
    assert!(exec.bound(INPUT_IDS).is_none());
    Ok(())
}

#[test]
fn test_enqueue_requires_inputs() -> Result<()> {
    let mut exec = executor()?;
    let err = exec.enqueue(&Stream::new(&Device::Cpu)).unwrap_err();
    assert_eq!(error_category(&err), Some(ErrorCategory::Invariant));
    assert_eq!(exec.enqueued(), 0);
    Ok(())
}

#[test]
fn test_context_step_produces_logits() -> Result<()> {
    let dev = Device::Cpu;
    let stream = Stream::new(&dev);
    let mut exec = executor()?;
    exec.set_binding(INPUT_IDS, &Tensor::new(&[[3u32, 5, 0], [4, 2, 9]], &dev)?)?;
    exec.set_binding(CONTEXT_LENGTHS, &Tensor::new(&[2u32, 3], &dev)?)?;
    exec.set_binding(PAST_KEY_VALUE_LENGTHS, &Tensor::new(&[0u32, 0], &dev)?)?;
    exec.set_binding(HOST_REQUEST_TYPES, &Tensor::new(&[0u32, 0], &dev)?)?;
    exec.set_binding(
        &past_key_value(0),
        &Tensor::zeros((2, 2, 1, 16, 4), DType::F32, &dev)?,
    )?;
    exec.enqueue(&stream)?;

    let logits = exec.output(LOGITS)?;
    assert_eq!(logits.dims(), &[2, IDENTITY_VOCAB]);
    assert_eq!(logits.argmax(1)?.to_vec1::<u32>()?, vec![5, 9]);
    assert_eq!(exec.enqueued(), 1);
    assert!(exec.produced_outputs().any(|(name, _)| name == LOGITS));
    assert_eq!(exec.bound_inputs().count(), 5);

    let names: Vec<String> = exec.shape_signature().into_iter().map(|(n, _)| n).collect();
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert!(names.contains(&INPUT_IDS.to_string()));
    Ok(())
}

#[test]
fn test_bound_output_is_filled_in_place() -> Result<()> {
    let dev = Device::Cpu;
    let stream = Stream::new(&dev);
    let mut exec = executor()?;
    let out = Tensor::zeros((1, IDENTITY_VOCAB), DType::F32, &dev)?;
    exec.set_binding(LOGITS, &out)?;
    exec.set_binding(INPUT_IDS, &Tensor::new(&[[7u32]], &dev)?)?;
    exec.set_binding(CONTEXT_LENGTHS, &Tensor::new(&[1u32], &dev)?)?;
    exec.set_binding(PAST_KEY_VALUE_LENGTHS, &Tensor::new(&[0u32], &dev)?)?;
    exec.set_binding(HOST_REQUEST_TYPES, &Tensor::new(&[0u32], &dev)?)?;
    exec.set_binding(
        &past_key_value(0),
        &Tensor::zeros((1, 2, 1, 16, 4), DType::F32, &dev)?,
    )?;
    exec.enqueue(&stream)?;
    assert_eq!(out.argmax(1)?.to_vec1::<u32>()?, vec![7]);
    Ok(())
}
