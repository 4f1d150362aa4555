//! Net: a DAG of layers wired by named blobs
//!
//! A [`Net`] is built once from a [`NetSpec`](spec::NetSpec) and then run
//! any number of times. Layers execute in declaration order; blob `i`
//! produced by one layer is read by later layers through shared handles.
//!
//! Construction:
//!
//! 1. split layers are inserted for blobs with several consumers,
//! 2. each layer is created, set up and reshaped against its bottoms,
//! 3. need-backward flags are derived: a layer needs backward if it has
//!    parameters or any bottom needs backward; layers that do not feed a
//!    loss are pruned from the backward pass,
//! 4. parameters with the same name are shared (data and diff),
//! 5. the top diffs of loss layers are seeded with their loss weights.

pub mod spec;
pub mod splits;

use crate::blob::Blob;
use crate::layers::{create_layer, Layer, Phase};
use crate::utils::{CancelEvent, SimpleRng};
use crate::{NetError, Result};
use log::debug;
use spec::{validate_net_spec, LayerKind, LayerSpec, NetSpec};
use std::collections::{HashMap, HashSet};

/// Where a parameter blob lives: layer index and position in its params.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ParamSlot {
    layer: usize,
    index: usize,
}

pub struct Net {
    name: String,
    phase: Phase,
    layers: Vec<Box<dyn Layer>>,
    layer_specs: Vec<LayerSpec>,
    blobs: Vec<Blob>,
    blob_names: Vec<String>,
    blob_index: HashMap<String, usize>,
    bottom_ids: Vec<Vec<usize>>,
    top_ids: Vec<Vec<usize>>,
    bottom_need_backward: Vec<Vec<bool>>,
    layer_need_backward: Vec<bool>,
    blob_need_backward: Vec<bool>,
    /// Learnable parameters (one entry per distinct parameter).
    params: Vec<Blob>,
    param_names: Vec<String>,
    param_owners: Vec<ParamSlot>,
    /// Non-owning parameter slots and the owner they alias.
    param_sharers: Vec<(ParamSlot, usize)>,
    cancel: Option<CancelEvent>,
    debug_info: bool,
}

impl std::fmt::Debug for Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Net")
            .field("name", &self.name)
            .field("layers", &self.layer_specs.len())
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

impl Net {
    /// Build and set up a net.
    ///
    /// # Errors
    ///
    /// Wiring errors from [`validate_net_spec`], layer setup and reshape
    /// errors, and mismatched shapes between layers sharing a parameter.
    pub fn new(spec: &NetSpec, phase: Phase, cancel: Option<CancelEvent>) -> Result<Net> {
        validate_net_spec(spec)?;
        let spec = splits::insert_splits(spec);
        let mut rng = SimpleRng::new(spec.random_seed);
        debug!(
            "Initializing net '{}' with {} layers",
            spec.name,
            spec.layers.len()
        );

        let mut net = Net {
            name: spec.name.clone(),
            phase,
            layers: Vec::with_capacity(spec.layers.len()),
            layer_specs: Vec::with_capacity(spec.layers.len()),
            blobs: Vec::new(),
            blob_names: Vec::new(),
            blob_index: HashMap::new(),
            bottom_ids: Vec::new(),
            top_ids: Vec::new(),
            bottom_need_backward: Vec::new(),
            layer_need_backward: Vec::new(),
            blob_need_backward: Vec::new(),
            params: Vec::new(),
            param_names: Vec::new(),
            param_owners: Vec::new(),
            param_sharers: Vec::new(),
            cancel,
            debug_info: spec.debug_info,
        };

        for layer_spec in &spec.layers {
            net.append_layer(layer_spec, &mut rng)?;
        }
        net.prune_non_loss_layers();
        net.seed_loss_weights();
        Ok(net)
    }

    fn append_layer(&mut self, layer_spec: &LayerSpec, rng: &mut SimpleRng) -> Result<()> {
        let li = self.layers.len();
        debug!("Creating layer {} ({})", layer_spec.name, layer_spec.kind.type_name());
        let mut layer = create_layer(&layer_spec.kind, rng);

        let mut bottom_ids = Vec::with_capacity(layer_spec.bottoms.len());
        let mut bottom_need = Vec::with_capacity(layer_spec.bottoms.len());
        for (bi, name) in layer_spec.bottoms.iter().enumerate() {
            let id = *self
                .blob_index
                .get(name)
                .ok_or_else(|| NetError::UnknownBlob(name.clone()))?;
            let allowed = layer_spec.propagate_down.get(bi).copied().unwrap_or(true);
            bottom_ids.push(id);
            bottom_need.push(self.blob_need_backward[id] && allowed);
            debug!("{} <- {}", layer_spec.name, name);
        }

        let bottoms = self.aliases(&bottom_ids);
        let mut tops: Vec<Blob> = layer_spec.tops.iter().map(|_| Blob::default()).collect();
        layer.setup(&bottoms, &mut tops)?;
        layer.reshape(&bottoms, &mut tops)?;

        let need_backward = match &layer_spec.kind {
            LayerKind::Input { need_backward, .. } => need_backward.iter().any(|&b| b),
            _ => !layer.params().is_empty() || bottom_need.iter().any(|&b| b),
        };

        let mut top_ids = Vec::with_capacity(tops.len());
        for (ti, (name, blob)) in layer_spec.tops.iter().zip(tops).enumerate() {
            debug!("{} -> {} [{}]", layer_spec.name, name, blob.shape_string());
            let top_need = match &layer_spec.kind {
                LayerKind::Input { need_backward, .. } => {
                    need_backward.get(ti).copied().unwrap_or(false)
                }
                _ => need_backward,
            };
            let id = self.blobs.len();
            self.blobs.push(blob);
            self.blob_names.push(name.clone());
            self.blob_index.insert(name.clone(), id);
            self.blob_need_backward.push(top_need);
            top_ids.push(id);
        }

        for index in 0..layer.params().len() {
            let slot = ParamSlot { layer: li, index };
            let name = layer_spec.params.get(index).filter(|n| !n.is_empty());
            let owner = name.and_then(|n| self.param_names.iter().position(|p| p == n));
            match owner {
                Some(k) => {
                    let owner_blob = &self.params[k];
                    let mine = &mut layer.params_mut()[index];
                    if mine.count() != owner_blob.count() {
                        return Err(NetError::ShapeMismatch(format!(
                            "layer '{}' shares parameter '{}' with shape {} but owner has {}",
                            layer_spec.name,
                            self.param_names[k],
                            mine.shape_string(),
                            owner_blob.shape_string()
                        )));
                    }
                    mine.share_data(owner_blob);
                    mine.share_diff(owner_blob);
                    self.param_sharers.push((slot, k));
                }
                None => {
                    let display = match name {
                        Some(n) => n.clone(),
                        None => format!("{}.{}", layer_spec.name, index),
                    };
                    self.params.push(layer.params()[index].alias());
                    self.param_names.push(display);
                    self.param_owners.push(slot);
                }
            }
        }

        debug!(
            "{} {} backward computation",
            layer_spec.name,
            if need_backward { "needs" } else { "does not need" }
        );
        self.layers.push(layer);
        self.layer_specs.push(layer_spec.clone());
        self.bottom_ids.push(bottom_ids);
        self.top_ids.push(top_ids);
        self.bottom_need_backward.push(bottom_need);
        self.layer_need_backward.push(need_backward);
        Ok(())
    }

    /// Drop backward work for layers whose tops never reach a loss.
    fn prune_non_loss_layers(&mut self) {
        let mut under_loss: HashSet<usize> = HashSet::new();
        for li in (0..self.layers.len()).rev() {
            let spec = &self.layer_specs[li];
            let contributes = self.top_ids[li]
                .iter()
                .enumerate()
                .any(|(ti, id)| spec.top_loss_weight(ti) != 0.0 || under_loss.contains(id));
            if contributes {
                under_loss.extend(self.bottom_ids[li].iter().copied());
            } else {
                if self.layer_need_backward[li] {
                    debug!("{} does not contribute to a loss; skipping backward", spec.name);
                }
                self.layer_need_backward[li] = false;
                self.bottom_need_backward[li].iter_mut().for_each(|b| *b = false);
            }
        }
    }

    fn seed_loss_weights(&mut self) {
        for (li, spec) in self.layer_specs.iter().enumerate() {
            for (ti, &id) in self.top_ids[li].iter().enumerate() {
                let weight = spec.top_loss_weight(ti);
                if weight != 0.0 {
                    self.blobs[id].set_diff(weight);
                }
            }
        }
    }

    fn aliases(&self, ids: &[usize]) -> Vec<Blob> {
        ids.iter().map(|&i| self.blobs[i].alias()).collect()
    }

    fn check_cancel(&self) -> Result<()> {
        match &self.cancel {
            Some(c) if c.is_set() => Err(NetError::Cancelled),
            _ => Ok(()),
        }
    }

    fn check_range(&self, index: usize) -> Result<()> {
        if index >= self.layers.len() {
            return Err(NetError::InvalidConfig(format!(
                "layer index {} out of range for net '{}' with {} layers",
                index,
                self.name,
                self.layers.len()
            )));
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn layer_names(&self) -> Vec<&str> {
        self.layer_specs.iter().map(|s| s.name.as_str()).collect()
    }

    /// Layer description after split insertion.
    pub fn layer_spec(&self, index: usize) -> &LayerSpec {
        &self.layer_specs[index]
    }

    pub fn layer(&self, index: usize) -> &dyn Layer {
        self.layers[index].as_ref()
    }

    pub fn layer_index(&self, name: &str) -> Result<usize> {
        self.layer_specs
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| NetError::UnknownLayer(name.to_string()))
    }

    pub fn blob_names(&self) -> &[String] {
        &self.blob_names
    }

    pub fn blob_by_name(&self, name: &str) -> Result<&Blob> {
        self.blob_index
            .get(name)
            .map(|&i| &self.blobs[i])
            .ok_or_else(|| NetError::UnknownBlob(name.to_string()))
    }

    /// Mutable access, for reshaping inputs or re-pointing their storage.
    pub fn blob_by_name_mut(&mut self, name: &str) -> Result<&mut Blob> {
        match self.blob_index.get(name) {
            Some(&i) => Ok(&mut self.blobs[i]),
            None => Err(NetError::UnknownBlob(name.to_string())),
        }
    }

    pub fn blob_need_backward(&self, name: &str) -> Result<bool> {
        self.blob_index
            .get(name)
            .map(|&i| self.blob_need_backward[i])
            .ok_or_else(|| NetError::UnknownBlob(name.to_string()))
    }

    pub fn layer_need_backward(&self, index: usize) -> bool {
        self.layer_need_backward[index]
    }

    /// Distinct learnable parameters in creation order.
    pub fn params(&self) -> &[Blob] {
        &self.params
    }

    pub fn param_names(&self) -> &[String] {
        &self.param_names
    }

    pub fn clear_param_diffs(&self) {
        for p in &self.params {
            p.set_diff(0.0);
        }
    }

    /// Point every parameter at the storage of `blobs` (same order as
    /// [`Net::params`]), including the layers that share it by name.
    pub fn share_params(&mut self, blobs: &[Blob]) -> Result<()> {
        if blobs.len() != self.params.len() {
            return Err(NetError::InvalidConfig(format!(
                "net '{}' has {} parameters, {} given",
                self.name,
                self.params.len(),
                blobs.len()
            )));
        }
        for (k, source) in blobs.iter().enumerate() {
            if source.count() != self.params[k].count() {
                return Err(NetError::ShapeMismatch(format!(
                    "parameter '{}' is {}, replacement is {}",
                    self.param_names[k],
                    self.params[k].shape_string(),
                    source.shape_string()
                )));
            }
        }
        for (k, source) in blobs.iter().enumerate() {
            let slot = self.param_owners[k];
            let blob = &mut self.layers[slot.layer].params_mut()[slot.index];
            blob.share_data(source);
            blob.share_diff(source);
            self.params[k] = blob.alias();
        }
        for &(slot, k) in &self.param_sharers {
            let blob = &mut self.layers[slot.layer].params_mut()[slot.index];
            blob.share_data(&self.params[k]);
            blob.share_diff(&self.params[k]);
        }
        Ok(())
    }

    /// Propagate shape changes of the input blobs through every layer.
    pub fn reshape(&mut self) -> Result<()> {
        for li in 0..self.layers.len() {
            let bottoms = self.aliases(&self.bottom_ids[li]);
            let mut tops: Vec<Blob> = self.top_ids[li]
                .iter()
                .map(|&i| std::mem::take(&mut self.blobs[i]))
                .collect();
            let result = self.layers[li].reshape(&bottoms, &mut tops);
            for (&i, blob) in self.top_ids[li].iter().zip(tops) {
                self.blobs[i] = blob;
            }
            result?;
        }
        self.seed_loss_weights();
        Ok(())
    }

    /// Run layers `start..=end`; returns the weighted loss they produced.
    pub fn forward_from_to(&mut self, start: usize, end: usize) -> Result<f32> {
        self.check_range(end)?;
        let mut loss = 0.0;
        for li in start..=end {
            self.check_cancel()?;
            let bottoms = self.aliases(&self.bottom_ids[li]);
            let tops = self.aliases(&self.top_ids[li]);
            self.layers[li].forward(&bottoms, &tops)?;

            let spec = &self.layer_specs[li];
            for (ti, top) in tops.iter().enumerate() {
                let weight = spec.top_loss_weight(ti);
                if weight != 0.0 {
                    loss += weight * top.data().iter().sum::<f32>();
                }
            }
            if self.debug_info {
                for (ti, top) in tops.iter().enumerate() {
                    debug!(
                        "    [Forward] Layer {}, top blob {} data: {}",
                        spec.name,
                        self.blob_names[self.top_ids[li][ti]],
                        top.asum_data() / top.count().max(1) as f32
                    );
                }
            }
        }
        Ok(loss)
    }

    pub fn forward_to(&mut self, end: usize) -> Result<f32> {
        self.forward_from_to(0, end)
    }

    /// Run the whole net; returns the total loss.
    pub fn forward(&mut self) -> Result<f32> {
        let last = self.layers.len().saturating_sub(1);
        self.forward_from_to(0, last)
    }

    /// Backpropagate through layers `start` down to `end` (inclusive).
    pub fn backward_from_to(&mut self, start: usize, end: usize) -> Result<()> {
        self.check_range(start)?;
        for li in (end..=start).rev() {
            if !self.layer_need_backward[li] {
                continue;
            }
            self.check_cancel()?;
            let bottoms = self.aliases(&self.bottom_ids[li]);
            let tops = self.aliases(&self.top_ids[li]);
            self.layers[li].backward(&tops, &self.bottom_need_backward[li], &bottoms)?;

            if self.debug_info {
                let spec = &self.layer_specs[li];
                for (bi, bottom) in bottoms.iter().enumerate() {
                    if self.bottom_need_backward[li][bi] {
                        debug!(
                            "    [Backward] Layer {}, bottom blob {} diff: {}",
                            spec.name,
                            self.blob_names[self.bottom_ids[li][bi]],
                            bottom.sumsq_diff().sqrt()
                        );
                    }
                }
            }
        }
        Ok(())
    }

    pub fn backward_from(&mut self, start: usize) -> Result<()> {
        self.backward_from_to(start, 0)
    }

    pub fn backward(&mut self) -> Result<()> {
        let last = self.layers.len().saturating_sub(1);
        self.backward_from_to(last, 0)
    }
}
