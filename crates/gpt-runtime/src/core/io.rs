use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

use crate::decoder::{DecoderRequest, WordsList};
use crate::error::RuntimeError;

/// Called after every decoder step with the ids so far (`[B, w, S_cap]`), the
/// step index and whether every sequence has finished.
pub type TokenCallback = Box<dyn FnMut(&Tensor, usize, bool) + Send>;

/// Tokenized prompts for one `generate` call.
#[derive(Debug, Clone)]
pub struct GenerationInput {
    /// `[B, S_max]` padded or `[1, sum(S_i)]` packed.
    pub ids: Tensor,
    /// `[B]` prompt lengths.
    pub lengths: Tensor,
    pub packed: bool,
    /// Defaults to the last vocabulary id.
    pub end_id: Option<u32>,
    /// Defaults to the last vocabulary id.
    pub pad_id: Option<u32>,
    /// Defaults to the room left after the prompt.
    pub max_new_tokens: Option<usize>,
    /// `[V']` added to every step's logits.
    pub embedding_bias: Option<Tensor>,
    /// One list for the whole batch or one per sequence.
    pub bad_words: Vec<WordsList>,
    pub stop_words: Vec<WordsList>,
}

impl GenerationInput {
    pub fn padded(ids: Tensor, lengths: Tensor) -> Self {
        Self::new(ids, lengths, false)
    }

    pub fn packed(ids: Tensor, lengths: Tensor) -> Self {
        Self::new(ids, lengths, true)
    }

    /// Pads `prompts` into a `[B, S_max]` batch.
    pub fn from_prompts(prompts: &[Vec<u32>], device: &Device) -> Result<Self> {
        ensure!(!prompts.is_empty(), RuntimeError::configuration("empty batch"));
        let width = prompts.iter().map(Vec::len).max().unwrap_or(0);
        let mut flat = Vec::with_capacity(prompts.len() * width);
        for prompt in prompts {
            flat.extend_from_slice(prompt);
            flat.extend(std::iter::repeat_n(0, width - prompt.len()));
        }
        let lengths: Vec<u32> = prompts.iter().map(|p| p.len() as u32).collect();
        Ok(Self::padded(
            Tensor::from_vec(flat, (prompts.len(), width), device)?,
            Tensor::new(lengths.as_slice(), device)?,
        ))
    }

    fn new(ids: Tensor, lengths: Tensor, packed: bool) -> Self {
        Self {
            ids,
            lengths,
            packed,
            end_id: None,
            pad_id: None,
            max_new_tokens: None,
            embedding_bias: None,
            bad_words: Vec::new(),
            stop_words: Vec::new(),
        }
    }

    pub fn with_end_id(mut self, end_id: u32) -> Self {
        self.end_id = Some(end_id);
        self
    }

    pub fn with_pad_id(mut self, pad_id: u32) -> Self {
        self.pad_id = Some(pad_id);
        self
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = Some(max_new_tokens);
        self
    }

    pub fn with_embedding_bias(mut self, bias: Tensor) -> Self {
        self.embedding_bias = Some(bias);
        self
    }

    pub fn with_bad_words(mut self, lists: Vec<WordsList>) -> Self {
        self.bad_words = lists;
        self
    }

    pub fn with_stop_words(mut self, lists: Vec<WordsList>) -> Self {
        self.stop_words = lists;
        self
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.lengths.dims1()?)
    }

    pub fn input_lengths(&self) -> Result<Vec<usize>> {
        Ok(self
            .lengths
            .to_dtype(DType::U32)?
            .to_vec1::<u32>()?
            .into_iter()
            .map(|l| l as usize)
            .collect())
    }

    /// Splits the batch into one prompt per sequence.
    pub fn prompts(&self) -> Result<Vec<Vec<u32>>> {
        let lengths = self.input_lengths()?;
        ensure!(
            !lengths.is_empty(),
            RuntimeError::configuration("empty batch")
        );
        ensure!(
            lengths.iter().all(|&l| l > 0),
            RuntimeError::configuration("prompt lengths must be positive")
        );
        let (rows, width) = self.ids.dims2()?;
        let ids = self.ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
        if self.packed {
            let total: usize = lengths.iter().sum();
            ensure!(
                rows == 1 && width == total,
                RuntimeError::ShapeMismatch {
                    expected: vec![1, total],
                    actual: vec![rows, width],
                }
            );
            let mut offset = 0;
            Ok(lengths
                .iter()
                .map(|&len| {
                    let prompt = ids[0][offset..offset + len].to_vec();
                    offset += len;
                    prompt
                })
                .collect())
        } else {
            ensure!(
                rows == lengths.len() && lengths.iter().all(|&l| l <= width),
                RuntimeError::ShapeMismatch {
                    expected: vec![lengths.len(), lengths.iter().copied().max().unwrap_or(0)],
                    actual: vec![rows, width],
                }
            );
            Ok(ids
                .into_iter()
                .zip(&lengths)
                .map(|(row, &len)| row[..len].to_vec())
                .collect())
        }
    }

    fn words_for(
        lists: &[WordsList],
        idx: usize,
        batch_size: usize,
        what: &str,
    ) -> Result<WordsList> {
        match lists.len() {
            0 => Ok(WordsList::default()),
            1 => Ok(lists[0].clone()),
            n if n == batch_size => Ok(lists[idx].clone()),
            n => Err(RuntimeError::configuration(format!(
                "{what} has {n} lists for a batch of {batch_size}"
            ))
            .into()),
        }
    }

    /// One decoder request per sequence. Unset ids resolve to `vocab_size - 1`
    /// and an unset token budget to whatever `max_seq_length` leaves after the
    /// prompt.
    pub fn decoder_requests(
        &self,
        vocab_size: usize,
        max_seq_length: usize,
    ) -> Result<Vec<DecoderRequest>> {
        ensure!(vocab_size > 0, RuntimeError::configuration("empty vocabulary"));
        ensure!(
            self.max_new_tokens != Some(0),
            RuntimeError::configuration("max_new_tokens must be positive")
        );
        let last_id = (vocab_size - 1) as u32;
        let end_id = self.end_id.unwrap_or(last_id);
        let pad_id = self.pad_id.unwrap_or(last_id);
        let prompts = self.prompts()?;
        let batch_size = prompts.len();
        let bias = match &self.embedding_bias {
            Some(bias) => Some(bias.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        prompts
            .into_iter()
            .enumerate()
            .map(|(idx, prompt)| {
                let max_new_tokens = self
                    .max_new_tokens
                    .unwrap_or_else(|| max_seq_length.saturating_sub(prompt.len()));
                let mut request = DecoderRequest::new(prompt, max_new_tokens, end_id);
                request.pad_id = pad_id;
                request.embedding_bias = bias.clone();
                request.bad_words = Self::words_for(&self.bad_words, idx, batch_size, "bad_words")?;
                request.stop_words =
                    Self::words_for(&self.stop_words, idx, batch_size, "stop_words")?;
                Ok(request)
            })
            .collect()
    }
}

/// Results of one `generate` call.
#[derive(Default)]
pub struct GenerationOutput {
    /// `[B, w, S_cap]`; positions past a beam's length hold `end_id`.
    pub ids: Option<Tensor>,
    /// Tokens per beam, prompt included.
    pub lengths: Vec<Vec<usize>>,
    pub cum_log_probs: Vec<Vec<f32>>,
    /// `[num_tokens, V']` packed or `[B, S_max, V']` padded.
    pub context_logits: Option<Tensor>,
    /// `[B, w, steps, V']`.
    pub generation_logits: Option<Tensor>,
    want_context_logits: bool,
    want_generation_logits: bool,
    on_token: Option<TokenCallback>,
}

impl std::fmt::Debug for GenerationOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationOutput")
            .field("ids", &self.ids.as_ref().map(|t| t.dims().to_vec()))
            .field("lengths", &self.lengths)
            .field("want_context_logits", &self.want_context_logits)
            .field("want_generation_logits", &self.want_generation_logits)
            .field("on_token", &self.on_token.is_some())
            .finish()
    }
}

impl GenerationOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context_logits(mut self) -> Self {
        self.want_context_logits = true;
        self
    }

    pub fn with_generation_logits(mut self) -> Self {
        self.want_generation_logits = true;
        self
    }

    pub fn on_token(mut self, callback: impl FnMut(&Tensor, usize, bool) + Send + 'static) -> Self {
        self.on_token = Some(Box::new(callback));
        self
    }

    pub fn wants_context_logits(&self) -> bool {
        self.want_context_logits
    }

    pub fn wants_generation_logits(&self) -> bool {
        self.want_generation_logits
    }

    pub(crate) fn notify(&mut self, ids: &Tensor, step: usize, finished: bool) {
        if let Some(callback) = self.on_token.as_mut() {
            callback(ids, step, finished);
        }
    }

    /// Tokens of `beam` of sequence `seq`, prompt included.
    pub fn tokens(&self, seq: usize, beam: usize) -> Result<Vec<u32>> {
        let ids = self
            .ids
            .as_ref()
            .ok_or_else(|| RuntimeError::invariant("generation has not produced ids"))?;
        let len = self
            .lengths
            .get(seq)
            .and_then(|beams| beams.get(beam))
            .copied()
            .ok_or_else(|| RuntimeError::invariant(format!("no beam {beam} for sequence {seq}")))?;
        Ok(ids.get(seq)?.get(beam)?.narrow(0, 0, len)?.to_vec1::<u32>()?)
    }
}
