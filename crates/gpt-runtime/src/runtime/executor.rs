use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Result, ensure};
use candle_core::{DType, Tensor};
use tracing::debug;

use crate::error::RuntimeError;
use crate::runtime::engine::Engine;
use crate::runtime::stream::{Event, Stream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingIo {
    Input,
    Output,
}

/// Per-dimension bounds of a binding under the active optimization profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimProfile {
    pub min: Vec<usize>,
    pub max: Vec<usize>,
}

impl DimProfile {
    pub fn new(min: Vec<usize>, max: Vec<usize>) -> Self {
        Self { min, max }
    }

    pub fn fixed(shape: Vec<usize>) -> Self {
        Self {
            min: shape.clone(),
            max: shape,
        }
    }

    pub fn rank(&self) -> usize {
        self.max.len()
    }

    /// `Err(reason)` when `shape` falls outside the profile.
    pub fn admits(&self, shape: &[usize]) -> std::result::Result<(), String> {
        if shape.len() != self.rank() {
            return Err(format!("expected rank {}, got {}", self.rank(), shape.len()));
        }
        for (axis, ((&dim, &lo), &hi)) in shape.iter().zip(&self.min).zip(&self.max).enumerate() {
            if dim < lo || dim > hi {
                return Err(format!("dim {axis} = {dim} outside [{lo}, {hi}]"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindingDesc {
    pub name: String,
    pub io: BindingIo,
    pub dtype: DType,
    pub profile: DimProfile,
    /// Optional inputs may stay unbound; optional outputs are only produced
    /// when bound.
    pub optional: bool,
}

impl BindingDesc {
    pub fn input(name: impl Into<String>, dtype: DType, profile: DimProfile) -> Self {
        Self {
            name: name.into(),
            io: BindingIo::Input,
            dtype,
            profile,
            optional: false,
        }
    }

    pub fn output(name: impl Into<String>, dtype: DType, profile: DimProfile) -> Self {
        Self {
            name: name.into(),
            io: BindingIo::Output,
            dtype,
            profile,
            optional: false,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Bound tensors handed to a plan for one forward step.
#[derive(Debug)]
pub struct StepContext<'a> {
    inputs: &'a HashMap<String, Tensor>,
    wanted: &'a HashSet<String>,
}

impl<'a> StepContext<'a> {
    pub fn new(inputs: &'a HashMap<String, Tensor>, wanted: &'a HashSet<String>) -> Self {
        Self { inputs, wanted }
    }

    pub fn input(&self, name: &str) -> Result<&'a Tensor> {
        self.inputs.get(name).ok_or_else(|| {
            RuntimeError::invariant(format!("input binding '{name}' is not bound")).into()
        })
    }

    pub fn optional_input(&self, name: &str) -> Option<&'a Tensor> {
        self.inputs.get(name)
    }

    /// Whether the caller bound output `name`.
    pub fn wants(&self, name: &str) -> bool {
        self.wanted.contains(name)
    }
}

/// A compiled forward step with named bindings.
pub trait ExecutionPlan: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    fn bindings(&self) -> Vec<BindingDesc>;

    /// Runs one step. In-place inputs (the kv cache) are updated through the
    /// bound tensors; everything else comes back by output name.
    fn forward(&self, ctx: &StepContext<'_>) -> Result<HashMap<String, Tensor>>;
}

/// Binds tensors to a plan's named I/O and enqueues forward steps.
#[derive(Debug, Clone)]
pub struct RuntimeExecutor {
    plan: Arc<dyn ExecutionPlan>,
    descs: BTreeMap<String, BindingDesc>,
    inputs: HashMap<String, Tensor>,
    outputs: HashMap<String, Tensor>,
    enqueued: u64,
}

impl RuntimeExecutor {
    pub fn new(plan: Arc<dyn ExecutionPlan>) -> Self {
        let descs = plan
            .bindings()
            .into_iter()
            .map(|desc| (desc.name.clone(), desc))
            .collect();
        Self {
            plan,
            descs,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            enqueued: 0,
        }
    }

    pub fn from_engine(engine: &Engine, stream: &Stream) -> Result<Self> {
        Ok(Self::new(engine.build_plan(stream.device())?))
    }

    pub fn plan(&self) -> &Arc<dyn ExecutionPlan> {
        &self.plan
    }

    pub fn bindings(&self) -> impl Iterator<Item = &BindingDesc> {
        self.descs.values()
    }

    pub fn binding(&self, name: &str) -> Option<&BindingDesc> {
        self.descs.get(name)
    }

    /// Binds `tensor` to `name` after checking its dtype and shape against the
    /// binding's profile. Inputs keep sharing storage with `tensor`.
    pub fn set_binding(&mut self, name: &str, tensor: &Tensor) -> Result<()> {
        let desc = self
            .descs
            .get(name)
            .ok_or_else(|| RuntimeError::UnknownBinding(name.to_string()))?;
        ensure!(
            tensor.dtype() == desc.dtype,
            RuntimeError::KindMismatch(format!(
                "binding '{name}' expects {:?}, got {:?}",
                desc.dtype,
                tensor.dtype()
            ))
        );
        if let Err(reason) = desc.profile.admits(tensor.dims()) {
            return Err(RuntimeError::ShapeUnsupported {
                name: name.to_string(),
                shape: tensor.dims().to_vec(),
                reason,
            }
            .into());
        }
        match desc.io {
            BindingIo::Input => self.inputs.insert(name.to_string(), tensor.clone()),
            BindingIo::Output => self.outputs.insert(name.to_string(), tensor.clone()),
        };
        Ok(())
    }

    pub fn clear_binding(&mut self, name: &str) {
        self.inputs.remove(name);
        self.outputs.remove(name);
    }

    pub fn bound(&self, name: &str) -> Option<&Tensor> {
        self.inputs.get(name).or_else(|| self.outputs.get(name))
    }

    /// Output `name` produced by the last step.
    pub fn output(&self, name: &str) -> Result<&Tensor> {
        self.outputs.get(name).ok_or_else(|| {
            RuntimeError::invariant(format!("output '{name}' has not been produced")).into()
        })
    }

    pub fn bound_inputs(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.inputs.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    pub fn produced_outputs(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.outputs.iter().map(|(name, tensor)| (name.as_str(), tensor))
    }

    /// Reinstates outputs written by work replayed outside `enqueue`.
    #[cfg(feature = "cuda")]
    pub(crate) fn adopt_outputs(&mut self, outputs: &[(String, Tensor)]) {
        for (name, tensor) in outputs {
            self.outputs.insert(name.clone(), tensor.clone());
        }
        self.enqueued += 1;
    }

    /// Names and shapes of all bound inputs, ordered by name.
    pub fn shape_signature(&self) -> Vec<(String, Vec<usize>)> {
        let mut signature: Vec<_> = self
            .inputs
            .iter()
            .map(|(name, tensor)| (name.clone(), tensor.dims().to_vec()))
            .collect();
        signature.sort();
        signature
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued
    }

    /// Runs one forward step in stream order and returns the completion event.
    /// Plan failures surface as `ExecutionFailed`.
    pub fn enqueue(&mut self, stream: &Stream) -> Result<Event> {
        for desc in self.descs.values() {
            ensure!(
                desc.optional || desc.io == BindingIo::Output || self.inputs.contains_key(&desc.name),
                RuntimeError::invariant(format!("required input '{}' is not bound", desc.name))
            );
        }
        let wanted: HashSet<String> = self
            .descs
            .values()
            .filter(|d| d.io == BindingIo::Output && (!d.optional || self.outputs.contains_key(&d.name)))
            .map(|d| d.name.clone())
            .collect();
        let ctx = StepContext::new(&self.inputs, &wanted);
        let produced = self.plan.forward(&ctx).map_err(|e| {
            RuntimeError::ExecutionFailed(format!("{}: {e:#}", self.plan.name()))
        })?;
        for (name, tensor) in produced {
            if !wanted.contains(&name) {
                continue;
            }
            match self.outputs.get(&name) {
                Some(dst) if dst.dims() == tensor.dims() => {
                    dst.slice_set(&tensor.to_dtype(dst.dtype())?, 0, 0)?;
                }
                _ => {
                    self.outputs.insert(name, tensor);
                }
            }
        }
        self.enqueued += 1;
        debug!(plan = self.plan.name(), step = self.enqueued, "enqueued forward step");
        Ok(stream.record())
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[derive(Debug)]
    struct DoublePlan;

    impl ExecutionPlan for DoublePlan {
        fn name(&self) -> &str {
            "double"
        }

        fn bindings(&self) -> Vec<BindingDesc> {
            vec![
                BindingDesc::input("x", DType::F32, DimProfile::new(vec![1], vec![4])),
                BindingDesc::input("bias", DType::F32, DimProfile::fixed(vec![1])).optional(),
                BindingDesc::output("y", DType::F32, DimProfile::new(vec![1], vec![4])),
            ]
        }

        fn forward(&self, ctx: &StepContext<'_>) -> Result<HashMap<String, Tensor>> {
            let mut y = (ctx.input("x")? * 2.0)?;
            if let Some(bias) = ctx.optional_input("bias") {
                y = y.broadcast_add(bias)?;
            }
            Ok(HashMap::from([("y".to_string(), y)]))
        }
    }

    #[test]
    fn test_binding_checks() -> Result<()> {
        let mut exec = RuntimeExecutor::new(Arc::new(DoublePlan));
        let dev = Device::Cpu;
        let err = exec
            .set_binding("nope", &Tensor::zeros(1, DType::F32, &dev)?)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::UnknownBinding(_))
        ));
        let err = exec
            .set_binding("x", &Tensor::zeros(2, DType::U32, &dev)?)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::KindMismatch(_))
        ));
        let err = exec
            .set_binding("x", &Tensor::zeros(5, DType::F32, &dev)?)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::ShapeUnsupported { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_enqueue_writes_bound_output() -> Result<()> {
        let dev = Device::Cpu;
        let stream = Stream::new(&dev);
        let mut exec = RuntimeExecutor::new(Arc::new(DoublePlan));
        assert!(exec.enqueue(&stream).is_err());
        exec.set_binding("x", &Tensor::new(&[1.0f32, 2.0], &dev)?)?;
        let y = Tensor::zeros(2, DType::F32, &dev)?;
        exec.set_binding("y", &y)?;
        exec.enqueue(&stream)?;
        assert_eq!(y.to_vec1::<f32>()?, vec![2.0, 4.0]);

        exec.set_binding("bias", &Tensor::new(&[1.0f32], &dev)?)?;
        exec.enqueue(&stream)?;
        assert_eq!(exec.output("y")?.to_vec1::<f32>()?, vec![3.0, 5.0]);
        assert_eq!(exec.enqueued(), 2);
        assert_eq!(
            exec.shape_signature(),
            vec![("bias".to_string(), vec![1]), ("x".to_string(), vec![2])]
        );
        Ok(())
    }

    #[derive(Debug)]
    struct FailingPlan;

    impl ExecutionPlan for FailingPlan {
        fn name(&self) -> &str {
            "failing"
        }

        fn bindings(&self) -> Vec<BindingDesc> {
            Vec::new()
        }

        fn forward(&self, _ctx: &StepContext<'_>) -> Result<HashMap<String, Tensor>> {
            anyhow::bail!("kernel fault")
        }
    }

    #[test]
    fn test_plan_errors_are_execution_failures() {
        let mut exec = RuntimeExecutor::new(Arc::new(FailingPlan));
        let err = exec.enqueue(&Stream::new(&Device::Cpu)).unwrap_err();
        assert_eq!(
            crate::error::error_category(&err),
            Some(crate::error::ErrorCategory::Execution)
        );
        assert!(err.to_string().contains("kernel fault"));
    }
}
