//! Automatic split insertion
//!
//! A blob consumed by more than one layer gets a [`LayerKind::Split`] right
//! after its producer; each consumer then reads its own split top. The
//! split keeps a separate diff per consumer and sums them on the way back,
//! so gradients from every consumer reach the producer.

use super::spec::{LayerKind, LayerSpec, NetSpec};
use std::collections::HashMap;

pub fn split_layer_name(blob: &str, producer: &str, top_index: usize) -> String {
    format!("{}_{}_{}_split", blob, producer, top_index)
}

pub fn split_blob_name(blob: &str, producer: &str, top_index: usize, k: usize) -> String {
    format!("{}_{}_{}_split_{}", blob, producer, top_index, k)
}

/// Return a copy of `spec` with split layers inserted.
pub fn insert_splits(spec: &NetSpec) -> NetSpec {
    // blob name -> (producer layer, top index)
    let mut producer: HashMap<&str, (usize, usize)> = HashMap::new();
    // (producer layer, top index) -> consumers as (layer, bottom index)
    let mut consumers: HashMap<(usize, usize), Vec<(usize, usize)>> = HashMap::new();

    for (li, layer) in spec.layers.iter().enumerate() {
        for (bi, bottom) in layer.bottoms.iter().enumerate() {
            if let Some(&src) = producer.get(bottom.as_str()) {
                consumers.entry(src).or_default().push((li, bi));
            }
        }
        for (ti, top) in layer.tops.iter().enumerate() {
            producer.insert(top.as_str(), (li, ti));
        }
    }

    // (layer, bottom index) -> renamed bottom
    let mut renamed: HashMap<(usize, usize), String> = HashMap::new();
    for (&(li, ti), uses) in &consumers {
        if uses.len() < 2 {
            continue;
        }
        let layer = &spec.layers[li];
        for (k, &use_site) in uses.iter().enumerate() {
            renamed.insert(use_site, split_blob_name(&layer.tops[ti], &layer.name, ti, k));
        }
    }

    let mut out = NetSpec {
        layers: Vec::with_capacity(spec.layers.len()),
        ..spec.clone()
    };
    for (li, layer) in spec.layers.iter().enumerate() {
        let mut copy = layer.clone();
        for (bi, bottom) in copy.bottoms.iter_mut().enumerate() {
            if let Some(name) = renamed.get(&(li, bi)) {
                *bottom = name.clone();
            }
        }
        out.layers.push(copy);

        for (ti, top) in layer.tops.iter().enumerate() {
            let uses = consumers.get(&(li, ti)).map_or(0, |u| u.len());
            if uses < 2 {
                continue;
            }
            let tops: Vec<String> = (0..uses)
                .map(|k| split_blob_name(top, &layer.name, ti, k))
                .collect();
            out.layers.push(
                LayerSpec::new(split_layer_name(top, &layer.name, ti), LayerKind::Split)
                    .bottoms(&[top.as_str()])
                    .tops(&tops),
            );
        }
    }
    out
}
