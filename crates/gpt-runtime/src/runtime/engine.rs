use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, Tensor};
use safetensors::tensor::{Dtype, SafeTensors, View};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RuntimeError;
use crate::gemm::{GemmAlgoCache, GemmWrapper};
use crate::models::gpt::WeightMap;
use crate::models::{Communicator, GptModel, IdentityPlan, LocalComm};
use crate::runtime::executor::ExecutionPlan;
use crate::utils::{ModelConfig, OptimizationProfile};

const MODEL_CONFIG_KEY: &str = "model_config";
const PROFILE_KEY: &str = "optimization_profile";
const PLAN_KEY: &str = "plan";

/// Compute graph an engine instantiates.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    #[default]
    Gpt,
    Identity,
}

/// A loaded engine artifact: model description, optimization profile and
/// host weights. Plans are instantiated per device and rank.
#[derive(Debug, Clone)]
pub struct Engine {
    model: ModelConfig,
    profile: OptimizationProfile,
    plan: PlanKind,
    weights: Arc<WeightMap>,
}

fn load_error(msg: impl Into<String>) -> RuntimeError {
    RuntimeError::EngineLoad(msg.into())
}

impl Engine {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (_, metadata) = SafeTensors::read_metadata(bytes)
            .map_err(|e| load_error(format!("not a safetensors artifact: {e}")))?;
        let entries = metadata
            .metadata()
            .as_ref()
            .ok_or_else(|| load_error("artifact carries no metadata"))?;
        let entry = |key: &str| {
            entries
                .get(key)
                .ok_or_else(|| load_error(format!("artifact metadata lacks '{key}'")))
        };

        let model = ModelConfig::from_json_str(entry(MODEL_CONFIG_KEY)?)
            .map_err(|e| load_error(format!("{e:#}")))?;
        let profile: OptimizationProfile = serde_json::from_str(entry(PROFILE_KEY)?)
            .map_err(|e| load_error(format!("malformed optimization profile: {e}")))?;
        profile
            .validate()
            .map_err(|e| load_error(format!("{e:#}")))?;
        let plan: PlanKind = match entries.get(PLAN_KEY) {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| load_error(format!("malformed plan kind: {e}")))?,
            None => PlanKind::default(),
        };
        let weights = candle_core::safetensors::load_buffer(bytes, &Device::Cpu)
            .map_err(|e| load_error(format!("failed reading weights: {e}")))?;
        info!(
            plan = ?plan,
            layers = model.num_layers,
            tensors = weights.len(),
            "loaded engine"
        );
        Ok(Self {
            model,
            profile,
            plan,
            weights: Arc::new(weights),
        })
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .map_err(|e| load_error(format!("failed reading {}: {e}", path.display())))?;
        Self::from_bytes(&bytes).with_context(|| format!("in {}", path.display()))
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn profile(&self) -> &OptimizationProfile {
        &self.profile
    }

    pub fn plan_kind(&self) -> PlanKind {
        self.plan
    }

    pub fn weights(&self) -> &WeightMap {
        &self.weights
    }

    /// Model description as seen by `rank` of a `world_size` group.
    pub fn rank_config(&self, rank: usize, world_size: usize) -> Result<ModelConfig> {
        ensure!(
            self.model.tp_size == world_size,
            RuntimeError::configuration(format!(
                "engine was built for tp_size {}, group has {world_size} ranks",
                self.model.tp_size
            ))
        );
        let mut model = self.model.clone();
        model.tp_rank = rank;
        model.validate()?;
        Ok(model)
    }

    pub fn build_plan(&self, device: &Device) -> Result<Arc<dyn ExecutionPlan>> {
        self.build_plan_with(device, Arc::new(LocalComm))
    }

    pub fn build_plan_with(
        &self,
        device: &Device,
        comm: Arc<dyn Communicator>,
    ) -> Result<Arc<dyn ExecutionPlan>> {
        let model = self.rank_config(comm.rank(), comm.world_size())?;
        match self.plan {
            PlanKind::Gpt => Ok(Arc::new(GptModel::load(
                &model,
                &self.profile,
                &self.weights,
                comm,
                GemmWrapper::new(GemmAlgoCache::global()),
                device,
            )?)),
            PlanKind::Identity => Ok(Arc::new(IdentityPlan::new(model, self.profile))),
        }
    }
}

/// Host f32 tensor in the layout safetensors serializes.
struct F32View {
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl F32View {
    fn new(tensor: &Tensor) -> Result<Self> {
        let values = tensor
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        Ok(Self {
            shape: tensor.dims().to_vec(),
            bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        })
    }
}

impl View for F32View {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.bytes)
    }

    fn data_len(&self) -> usize {
        self.bytes.len()
    }
}

/// Writes engine artifacts. Weights are stored as f32 and cast to the model
/// type when a plan is built.
#[derive(Debug, Clone)]
pub struct EngineBuilder {
    model: ModelConfig,
    profile: OptimizationProfile,
    plan: PlanKind,
    weights: BTreeMap<String, Tensor>,
}

impl EngineBuilder {
    pub fn new(model: ModelConfig, plan: PlanKind) -> Self {
        Self {
            model,
            profile: OptimizationProfile::default(),
            plan,
            weights: BTreeMap::new(),
        }
    }

    pub fn with_profile(mut self, profile: OptimizationProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn weight(mut self, name: impl Into<String>, tensor: Tensor) -> Self {
        self.weights.insert(name.into(), tensor);
        self
    }

    pub fn weights(mut self, weights: impl IntoIterator<Item = (String, Tensor)>) -> Self {
        self.weights.extend(weights);
        self
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        self.model.validate()?;
        self.profile.validate()?;
        let metadata = HashMap::from([
            (
                MODEL_CONFIG_KEY.to_string(),
                serde_json::to_string(&self.model)?,
            ),
            (PROFILE_KEY.to_string(), serde_json::to_string(&self.profile)?),
            (PLAN_KEY.to_string(), serde_json::to_string(&self.plan)?),
        ]);
        let views = self
            .weights
            .iter()
            .map(|(name, tensor)| Ok((name.as_str(), F32View::new(tensor)?)))
            .collect::<Result<Vec<_>>>()?;
        safetensors::tensor::serialize(views, &Some(metadata))
            .map_err(|e| anyhow::anyhow!("failed serializing engine: {e}"))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let bytes = self.serialize()?;
        fs::write(path, bytes).with_context(|| format!("failed writing engine to {}", path.display()))
    }

    pub fn build(&self) -> Result<Engine> {
        Engine::from_bytes(&self.serialize()?)
    }
}
