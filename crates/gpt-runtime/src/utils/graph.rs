use anyhow::Result;
use candle_core::Device;
use tracing::debug;
#[cfg(feature = "cuda")]
use tracing::warn;

use crate::error::RuntimeError;
use crate::runtime::{Event, RuntimeExecutor, Stream};

#[cfg(feature = "cuda")]
use anyhow::anyhow;
#[cfg(feature = "cuda")]
use candle_core::Tensor;
#[cfg(feature = "cuda")]
use candle_core::cuda_backend::cudarc::driver::sys::{
    CUgraph, CUgraphExec, CUgraphInstantiate_flags, CUstream, CUstreamCaptureMode, lib,
};

/// Everything a recorded step depends on. A launch is only valid while the
/// key it was recorded under still describes the executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphKey {
    pub active: Vec<bool>,
    pub shapes: Vec<(String, Vec<usize>)>,
    pub block_pointers: Vec<u32>,
}

impl GraphKey {
    pub fn new(active: Vec<bool>, executor: &RuntimeExecutor, block_pointers: Vec<u32>) -> Self {
        Self {
            active,
            shapes: executor.shape_signature(),
            block_pointers,
        }
    }
}

/// Driver graph captured from one generation step on a cuda stream.
#[cfg(feature = "cuda")]
struct DeviceGraph {
    cu_graph: CUgraph,
    cu_graph_exec: CUgraphExec,
    stream: CUstream,
}

#[cfg(feature = "cuda")]
unsafe impl Send for DeviceGraph {}

#[cfg(feature = "cuda")]
impl DeviceGraph {
    fn begin_capture(device: &Device) -> Result<()> {
        let cuda = device.as_cuda_device()?;
        unsafe {
            lib()
                .cuStreamBeginCapture_v2(
                    cuda.cu_stream().clone(),
                    CUstreamCaptureMode::CU_STREAM_CAPTURE_MODE_RELAXED,
                )
                .result()
                .map_err(|e| anyhow!("failed to begin stream capture: {e:?}"))?;
        }
        Ok(())
    }

    fn end_capture(device: &Device) -> Result<Self> {
        let cuda = device.as_cuda_device()?;
        let stream = cuda.cu_stream().clone();
        let mut cu_graph = std::mem::MaybeUninit::uninit();
        let cu_graph = unsafe {
            lib()
                .cuStreamEndCapture(stream, cu_graph.as_mut_ptr())
                .result()
                .map_err(|e| anyhow!("failed to end stream capture: {e:?}"))?;
            cu_graph.assume_init()
        };
        let mut cu_graph_exec = std::mem::MaybeUninit::uninit();
        let instantiated = unsafe {
            lib()
                .cuGraphInstantiateWithFlags(
                    cu_graph_exec.as_mut_ptr(),
                    cu_graph,
                    CUgraphInstantiate_flags::CUDA_GRAPH_INSTANTIATE_FLAG_AUTO_FREE_ON_LAUNCH
                        as u32 as u64,
                )
                .result()
        };
        if let Err(e) = instantiated {
            unsafe {
                let _ = lib().cuGraphDestroy(cu_graph);
            }
            return Err(anyhow!("failed to instantiate graph: {e:?}"));
        }
        let cu_graph_exec = unsafe { cu_graph_exec.assume_init() };
        Ok(Self {
            cu_graph,
            cu_graph_exec,
            stream,
        })
    }

    fn launch(&self) -> Result<()> {
        unsafe {
            lib()
                .cuGraphLaunch(self.cu_graph_exec, self.stream)
                .result()
                .map_err(|e| anyhow!("failed to launch graph: {e:?}"))?;
        }
        Ok(())
    }
}

#[cfg(feature = "cuda")]
impl Drop for DeviceGraph {
    fn drop(&mut self) {
        unsafe {
            let _ = lib().cuGraphExecDestroy(self.cu_graph_exec);
            let _ = lib().cuGraphDestroy(self.cu_graph);
        }
    }
}

/// A captured step together with the buffers its kernels read and write.
/// Replays copy fresh inputs into the captured buffers first.
#[cfg(feature = "cuda")]
struct CapturedStep {
    graph: DeviceGraph,
    inputs: Vec<(String, Tensor)>,
    outputs: Vec<(String, Tensor)>,
}

#[cfg(feature = "cuda")]
impl CapturedStep {
    fn record(executor: &mut RuntimeExecutor, stream: &Stream) -> Result<Self> {
        let inputs: Vec<(String, Tensor)> = executor
            .bound_inputs()
            .map(|(name, tensor)| (name.to_string(), tensor.clone()))
            .collect();
        DeviceGraph::begin_capture(stream.device())?;
        let recorded = executor.enqueue(stream);
        // Capture must be ended even when recording failed.
        let graph = DeviceGraph::end_capture(stream.device());
        recorded?;
        let graph = graph?;
        let outputs = executor
            .produced_outputs()
            .map(|(name, tensor)| (name.to_string(), tensor.clone()))
            .collect();
        Ok(Self {
            graph,
            inputs,
            outputs,
        })
    }

    fn replay(&self, executor: &mut RuntimeExecutor, stream: &Stream) -> Result<Event> {
        for (name, captured) in &self.inputs {
            if let Some(current) = executor.bound(name) {
                if current.id() != captured.id() {
                    captured.slice_set(current, 0, 0)?;
                }
            }
        }
        self.graph.launch()?;
        executor.adopt_outputs(&self.outputs);
        Ok(stream.record())
    }
}

struct GraphInstance {
    key: GraphKey,
    uploaded: bool,
    launches: u64,
    #[cfg(feature = "cuda")]
    captured: Option<CapturedStep>,
}

impl GraphInstance {
    fn new(key: GraphKey) -> Self {
        Self {
            key,
            uploaded: false,
            launches: 0,
            #[cfg(feature = "cuda")]
            captured: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphStats {
    pub captures: u64,
    pub updates: u64,
    pub invalidations: u64,
    pub launches: u64,
    /// Launches served by a driver graph instead of an eager replay.
    pub device_replays: u64,
}

/// Two ping-pong launch-graph slots. Each step prepares the slot the previous
/// step did not use: an instance whose key still matches is updated in place,
/// a stale one is cleared and recorded again.
///
/// With the `cuda` feature on a cuda device the first launch of an instance
/// captures the step into a driver graph and later launches replay it. Other
/// devices replay the plan eagerly through the executor, and so does every
/// launch after a failed capture.
#[derive(Default)]
pub struct LaunchGraph {
    instances: [Option<GraphInstance>; 2],
    next: usize,
    stats: GraphStats,
    device_capture: bool,
}

impl std::fmt::Debug for LaunchGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchGraph")
            .field("keys", &[self.key(0), self.key(1)])
            .field("next", &self.next)
            .field("stats", &self.stats)
            .field("device_capture", &self.device_capture)
            .finish()
    }
}

impl LaunchGraph {
    pub fn new(device: &Device) -> Self {
        let device_capture = cfg!(feature = "cuda") && device.is_cuda();
        if device_capture {
            debug!("launch graph captures generation steps on the device");
        } else {
            debug!("launch graph replays generation steps eagerly");
        }
        Self {
            device_capture,
            ..Self::default()
        }
    }

    pub fn stats(&self) -> GraphStats {
        self.stats
    }

    pub fn captures_on_device(&self) -> bool {
        self.device_capture
    }

    pub fn key(&self, slot: usize) -> Option<&GraphKey> {
        self.instances.get(slot)?.as_ref().map(|inst| &inst.key)
    }

    /// Records a fresh instance under `key` in `slot`.
    pub fn create(&mut self, slot: usize, key: GraphKey) {
        self.instances[slot % 2] = Some(GraphInstance::new(key));
        self.stats.captures += 1;
    }

    /// Updates `slot` in place when its topology still matches `key`.
    pub fn update(&mut self, slot: usize, key: &GraphKey) -> bool {
        match self.instances[slot % 2].as_mut() {
            Some(inst) if inst.key == *key => {
                self.stats.updates += 1;
                true
            }
            _ => false,
        }
    }

    pub fn upload(&mut self, slot: usize) -> Result<()> {
        let inst = self.instances[slot % 2]
            .as_mut()
            .ok_or_else(|| RuntimeError::invariant(format!("launch graph slot {slot} is empty")))?;
        inst.uploaded = true;
        Ok(())
    }

    /// Picks the slot for the coming step and makes it launchable for `key`.
    pub fn prepare(&mut self, key: GraphKey) -> Result<usize> {
        let slot = self.next;
        self.next = (self.next + 1) % 2;
        if !self.update(slot, &key) {
            if self.instances[slot].take().is_some() {
                self.stats.invalidations += 1;
                debug!(slot, "launch graph invalidated");
            }
            self.create(slot, key);
        }
        self.upload(slot)?;
        Ok(slot)
    }

    pub fn launch(
        &mut self,
        slot: usize,
        executor: &mut RuntimeExecutor,
        stream: &Stream,
    ) -> Result<Event> {
        let inst = self.instances[slot % 2]
            .as_mut()
            .ok_or_else(|| RuntimeError::invariant(format!("launch graph slot {slot} is empty")))?;
        if !inst.uploaded {
            return Err(RuntimeError::invariant(format!(
                "launch graph slot {slot} was not uploaded"
            ))
            .into());
        }
        if inst.key.shapes != executor.shape_signature() {
            return Err(RuntimeError::invariant(format!(
                "launch graph slot {slot} no longer matches the bound shapes"
            ))
            .into());
        }
        inst.launches += 1;
        self.stats.launches += 1;
        #[cfg(feature = "cuda")]
        if self.device_capture {
            if inst.captured.is_none() {
                match CapturedStep::record(executor, stream) {
                    Ok(step) => inst.captured = Some(step),
                    Err(err) => {
                        warn!(slot, error = %err, "graph capture failed, replaying eagerly");
                        self.device_capture = false;
                    }
                }
            }
            if let Some(step) = inst.captured.as_ref() {
                self.stats.device_replays += 1;
                return step.replay(executor, stream);
            }
        }
        executor.enqueue(stream)
    }

    pub fn clear(&mut self) {
        self.instances = [None, None];
        self.next = 0;
    }
}
