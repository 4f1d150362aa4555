//! Tests for the CaffeGraph backend of the recurrent layer
//!
//! This file tests the unrolled-net execution path including:
//! - Output shapes and parameter layout for LSTM and RNN
//! - Hidden state carried between batches, reset and sequence restarts
//! - Rebuilding on timestep changes and skipping redundant reshapes
//! - Exposed hidden state and static input
//! - Configuration errors detected at setup

use approx::assert_abs_diff_eq;
use rust_recurrent_networks::blob::Blob;
use rust_recurrent_networks::config::{Engine, LayerParameter, RecurrentParameter, RecurrentType};
use rust_recurrent_networks::device::{Device, LayerContext};
use rust_recurrent_networks::layers::Layer;
use rust_recurrent_networks::recurrent::{BackendKind, RecurrentLayer};
use rust_recurrent_networks::utils::{CancelEvent, SimpleRng};
use rust_recurrent_networks::NetError;

const HIDDEN: usize = 3;

fn param(kind: RecurrentType) -> LayerParameter {
    let mut p = RecurrentParameter::new(HIDDEN, kind);
    p.engine = Engine::Caffe;
    LayerParameter::new("rec", p)
}

fn sequence(t: usize, n: usize, i: usize, seed: u64) -> Blob {
    let mut rng = SimpleRng::new(seed);
    let values = (0..t * n * i).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect();
    Blob::from_data(&[t, n, i], values)
}

fn cont(t: usize, n: usize, restart: bool) -> Blob {
    let mut values = vec![1.0; t * n];
    if restart {
        values[..n].fill(0.0);
    }
    Blob::from_data(&[t, n], values)
}

fn tops_for(p: &LayerParameter) -> Vec<Blob> {
    let extra = if p.recurrent_param.expose_hidden_output {
        match p.recurrent_param.recurrent_type {
            RecurrentType::Lstm => 2,
            RecurrentType::Rnn => 1,
        }
    } else {
        0
    };
    (0..1 + extra).map(|_| Blob::default()).collect()
}

fn ready_layer(p: LayerParameter, bottom: &[Blob]) -> (RecurrentLayer, Vec<Blob>) {
    let mut top = tops_for(&p);
    let mut layer = RecurrentLayer::new(p, &Device::reference()).unwrap();
    layer.setup(bottom, &mut top).unwrap();
    layer.reshape(bottom, &mut top).unwrap();
    (layer, top)
}

// ============================================================================
// Shape and Parameter Tests
// ============================================================================

mod shape_tests {
    use super::*;

    #[test]
    fn test_lstm_output_shape() {
        let bottom = vec![sequence(4, 2, 5, 1), cont(4, 2, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm), &bottom);

        assert_eq!(layer.backend_kind(), Some(BackendKind::CaffeGraph));
        assert_eq!(layer.layer_type(), "LSTM");
        assert_eq!(top[0].shape(), &[4, 2, HIDDEN]);

        layer.forward(&bottom, &top).unwrap();
        assert!(top[0].data_vec().iter().all(|v| v.is_finite() && v.abs() < 1.0));
    }

    #[test]
    fn test_lstm_parameters() {
        let bottom = vec![sequence(2, 1, 5, 1), cont(2, 1, true)];
        let (layer, _) = ready_layer(param(RecurrentType::Lstm), &bottom);

        let shapes: Vec<Vec<usize>> = layer.params().iter().map(|p| p.shape().to_vec()).collect();
        assert_eq!(
            shapes,
            vec![vec![4 * HIDDEN, 5], vec![4 * HIDDEN], vec![4 * HIDDEN, HIDDEN]]
        );
        let net = layer.unrolled_net().unwrap();
        assert_eq!(net.param_names(), &["W_xc", "b_c", "W_hc"]);
    }

    #[test]
    fn test_rnn_parameters_and_output() {
        let bottom = vec![sequence(3, 2, 4, 2), cont(3, 2, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Rnn), &bottom);

        assert_eq!(layer.layer_type(), "RNN");
        assert_eq!(layer.params().len(), 5);
        layer.forward(&bottom, &top).unwrap();
        assert_eq!(top[0].shape(), &[3, 2, HIDDEN]);
    }

    #[test]
    fn test_unrolled_net_has_one_unit_per_step() {
        let bottom = vec![sequence(3, 1, 2, 3), cont(3, 1, true)];
        let (layer, _) = ready_layer(param(RecurrentType::Lstm), &bottom);
        let net = layer.unrolled_net().unwrap();
        for t in 1..=3 {
            assert!(net.layer_index(&format!("unit_{}", t)).is_ok());
        }
        assert!(net.layer_index("unit_4").is_err());
    }

    #[test]
    fn test_same_seed_same_output() {
        let bottom = vec![sequence(3, 2, 2, 4), cont(3, 2, true)];
        let (mut a, top_a) = ready_layer(param(RecurrentType::Lstm), &bottom);
        let (mut b, top_b) = ready_layer(param(RecurrentType::Lstm), &bottom);
        a.forward(&bottom, &top_a).unwrap();
        b.forward(&bottom, &top_b).unwrap();
        assert_eq!(top_a[0].data_vec(), top_b[0].data_vec());
    }
}

// ============================================================================
// Recurrent State Tests
// ============================================================================

mod state_tests {
    use super::*;

    #[test]
    fn test_state_carried_between_batches() {
        let first = vec![sequence(3, 2, 2, 5), cont(3, 2, true)];
        let second = vec![sequence(3, 2, 2, 6), cont(3, 2, false)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm), &first);

        layer.forward(&first, &top).unwrap();
        let carried: Vec<Vec<f32>> = layer.final_state().unwrap().iter().map(Blob::data_vec).collect();
        assert!(carried[0].iter().any(|&v| v != 0.0));

        layer.forward(&second, &top).unwrap();
        let initial: Vec<Vec<f32>> = layer.initial_state().unwrap().iter().map(Blob::data_vec).collect();
        assert_eq!(initial, carried);
    }

    #[test]
    fn test_reset_zeroes_initial_state() {
        let bottom = vec![sequence(3, 2, 2, 7), cont(3, 2, false)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm), &bottom);

        layer.forward(&bottom, &top).unwrap();
        layer.reset().unwrap();
        layer.forward(&bottom, &top).unwrap();
        for blob in layer.initial_state().unwrap() {
            assert!(blob.data_vec().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_restart_ignores_carried_state() {
        let bottom = vec![sequence(4, 2, 3, 8), cont(4, 2, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Rnn), &bottom);

        layer.forward(&bottom, &top).unwrap();
        let first = top[0].data_vec();
        layer.forward(&bottom, &top).unwrap();
        let second = top[0].data_vec();
        for (a, b) in first.iter().zip(&second) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_continued_sequence_differs_from_restart() {
        let restart = vec![sequence(2, 1, 2, 9), cont(2, 1, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm), &restart);
        layer.forward(&restart, &top).unwrap();
        let fresh = top[0].data_vec();

        let continued = vec![restart[0].alias(), cont(2, 1, false)];
        let mut top = top;
        layer.reshape(&continued, &mut top).unwrap();
        layer.forward(&continued, &top).unwrap();
        assert_ne!(top[0].data_vec(), fresh);
    }
}

// ============================================================================
// Reshape Tests
// ============================================================================

mod reshape_tests {
    use super::*;

    #[test]
    fn test_identical_reshape_is_skipped() {
        let bottom = vec![sequence(3, 2, 2, 10), cont(3, 2, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm), &bottom);
        let rebuilds = layer.rebuild_count();

        assert!(!layer.reshape_needed(&bottom));
        layer.reshape(&bottom, &mut top).unwrap();
        assert_eq!(layer.rebuild_count(), rebuilds);
    }

    #[test]
    fn test_new_storage_needs_reshape() {
        let bottom = vec![sequence(3, 2, 2, 11), cont(3, 2, true)];
        let (layer, _) = ready_layer(param(RecurrentType::Lstm), &bottom);

        let moved = vec![bottom[0].duplicate(), bottom[1].alias()];
        assert!(layer.reshape_needed(&moved));
    }

    #[test]
    fn test_timestep_change_rebuilds_net() {
        let short = vec![sequence(2, 2, 2, 12), cont(2, 2, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm), &short);
        let rebuilds = layer.rebuild_count();

        let long = vec![sequence(5, 2, 2, 13), cont(5, 2, true)];
        layer.reshape(&long, &mut top).unwrap();
        assert_eq!(layer.rebuild_count(), rebuilds + 1);
        assert_eq!(top[0].shape(), &[5, 2, HIDDEN]);
        layer.forward(&long, &top).unwrap();
        assert!(layer.unrolled_net().unwrap().layer_index("unit_5").is_ok());
    }

    #[test]
    fn test_batch_change_reshapes_without_rebuild() {
        let small = vec![sequence(3, 1, 2, 14), cont(3, 1, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm), &small);
        let rebuilds = layer.rebuild_count();

        let large = vec![sequence(3, 4, 2, 15), cont(3, 4, true)];
        layer.reshape(&large, &mut top).unwrap();
        assert_eq!(layer.rebuild_count(), rebuilds);
        assert_eq!(top[0].shape(), &[3, 4, HIDDEN]);
        layer.forward(&large, &top).unwrap();
    }

    #[test]
    fn test_rebuild_keeps_parameters() {
        let short = vec![sequence(2, 1, 2, 16), cont(2, 1, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Rnn), &short);
        let before: Vec<Blob> = layer.params().iter().map(Blob::alias).collect();

        let long = vec![sequence(4, 1, 2, 17), cont(4, 1, true)];
        layer.reshape(&long, &mut top).unwrap();
        let net = layer.unrolled_net().unwrap();
        for (old, new) in before.iter().zip(net.params()) {
            assert!(old.shares_data_with(new));
        }
    }
}

// ============================================================================
// Exposed Hidden State and Static Input Tests
// ============================================================================

mod exposure_tests {
    use super::*;

    #[test]
    fn test_exposed_state_matches_carried_state() {
        let first = vec![sequence(3, 2, 2, 20), cont(3, 2, true)];
        let second = vec![sequence(3, 2, 2, 21), cont(3, 2, false)];

        let (mut carried, top) = ready_layer(param(RecurrentType::Lstm), &first);
        carried.forward(&first, &top).unwrap();
        carried.forward(&second, &top).unwrap();
        let expected = top[0].data_vec();

        let mut p = param(RecurrentType::Lstm);
        p.recurrent_param.expose_hidden_input = true;
        p.recurrent_param.expose_hidden_output = true;
        let shared: Vec<Blob> = carried.params().iter().map(Blob::alias).collect();
        let h0 = Blob::new(&[1, 2, HIDDEN]);
        let c0 = Blob::new(&[1, 2, HIDDEN]);
        let bottom = vec![first[0].alias(), first[1].alias(), h0.alias(), c0.alias()];
        let mut top = tops_for(&p);
        let mut exposed = RecurrentLayer::new(p, &Device::reference())
            .unwrap()
            .with_params(shared);
        exposed.setup(&bottom, &mut top).unwrap();
        exposed.reshape(&bottom, &mut top).unwrap();
        exposed.forward(&bottom, &top).unwrap();
        assert_eq!(top[1].shape(), &[1, 2, HIDDEN]);

        h0.copy_data_from_slice(&top[1].data());
        c0.copy_data_from_slice(&top[2].data());
        let bottom = vec![second[0].alias(), second[1].alias(), h0.alias(), c0.alias()];
        exposed.reshape(&bottom, &mut top).unwrap();
        exposed.forward(&bottom, &top).unwrap();

        for (a, b) in top[0].data_vec().iter().zip(&expected) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_exposed_hidden_input_receives_gradient() {
        let mut p = param(RecurrentType::Rnn);
        p.recurrent_param.expose_hidden_input = true;
        let h0 = Blob::from_data(&[1, 1, HIDDEN], vec![0.5, -0.5, 0.25]);
        let bottom = vec![sequence(2, 1, 2, 22), cont(2, 1, false), h0.alias()];
        let (mut layer, top) = ready_layer(p, &bottom);

        layer.forward(&bottom, &top).unwrap();
        top[0].set_diff(1.0);
        layer.backward(&top, &[true, false, true], &bottom).unwrap();
        assert!(h0.diff_vec().iter().any(|&d| d != 0.0));
    }

    #[test]
    fn test_wrong_hidden_shape_rejected() {
        let mut p = param(RecurrentType::Rnn);
        p.recurrent_param.expose_hidden_input = true;
        let bottom = vec![sequence(2, 2, 2, 23), cont(2, 2, true), Blob::new(&[1, 1, HIDDEN])];
        let mut top = vec![Blob::default()];
        let mut layer = RecurrentLayer::new(p, &Device::reference()).unwrap();
        assert!(matches!(
            layer.setup(&bottom, &mut top),
            Err(NetError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_static_input_changes_output() {
        let x_static = Blob::from_data(&[2, 3], vec![0.1, 0.2, 0.3, -0.1, -0.2, -0.3]);
        let bottom = vec![sequence(3, 2, 2, 24), cont(3, 2, true), x_static.alias()];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm), &bottom);
        assert_eq!(layer.params().len(), 4);

        layer.forward(&bottom, &top).unwrap();
        let before = top[0].data_vec();
        x_static.copy_data_from_slice(&[1.0, 1.0, 1.0, -1.0, -1.0, -1.0]);
        layer.forward(&bottom, &top).unwrap();
        assert_ne!(top[0].data_vec(), before);

        top[0].set_diff(1.0);
        layer.backward(&top, &[true, false, true], &bottom).unwrap();
        assert!(x_static.diff_vec().iter().any(|&d| d != 0.0));
    }
}

// ============================================================================
// Backward and Error Tests
// ============================================================================

mod error_tests {
    use super::*;

    #[test]
    fn test_no_gradient_reaches_cont() {
        let bottom = vec![sequence(3, 2, 2, 30), cont(3, 2, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm), &bottom);
        layer.forward(&bottom, &top).unwrap();
        top[0].set_diff(1.0);

        layer.backward(&top, &[true, true], &bottom).unwrap();
        assert!(bottom[0].diff_vec().iter().any(|&d| d != 0.0));
        assert!(bottom[1].diff_vec().iter().all(|&d| d == 0.0));
        assert!(layer.params().iter().all(|p| p.sumsq_diff() > 0.0));
    }

    #[test]
    fn test_unpropagated_bottoms_keep_their_diff() {
        let bottom = vec![sequence(3, 2, 2, 32), cont(3, 2, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm), &bottom);
        layer.forward(&bottom, &top).unwrap();
        top[0].set_diff(1.0);
        bottom[0].set_diff(0.5);

        layer.backward(&top, &[false, false], &bottom).unwrap();
        assert!(bottom[0].diff_vec().iter().all(|&d| d == 0.5));
        assert!(layer.params().iter().all(|p| p.sumsq_diff() > 0.0));
    }

    #[test]
    fn test_unpropagated_hidden_input_keeps_its_diff() {
        let mut p = param(RecurrentType::Rnn);
        p.recurrent_param.expose_hidden_input = true;
        let h0 = Blob::from_data(&[1, 2, HIDDEN], vec![0.5; 2 * HIDDEN]);
        let bottom = vec![sequence(2, 2, 2, 33), cont(2, 2, false), h0.alias()];
        let (mut layer, top) = ready_layer(p, &bottom);
        layer.forward(&bottom, &top).unwrap();
        top[0].set_diff(1.0);

        layer.backward(&top, &[true, false, false], &bottom).unwrap();
        assert!(bottom[0].diff_vec().iter().any(|&d| d != 0.0));
        assert!(h0.diff_vec().iter().all(|&d| d == 0.0));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        for (t, n) in [(0, 2), (2, 0)] {
            let bottom = vec![Blob::new(&[t, n, 2]), Blob::new(&[t, n])];
            let mut top = vec![Blob::default()];
            let mut layer = RecurrentLayer::new(param(RecurrentType::Lstm), &Device::reference()).unwrap();
            assert!(matches!(layer.setup(&bottom, &mut top), Err(NetError::ShapeMismatch(_))));
        }
    }

    #[test]
    fn test_stacked_layers_need_native_engine() {
        let mut p = param(RecurrentType::Lstm);
        p.recurrent_param.num_layers = 2;
        let bottom = vec![sequence(2, 1, 2, 31), cont(2, 1, true)];
        let mut top = vec![Blob::default()];
        let mut layer = RecurrentLayer::new(p, &Device::reference()).unwrap();
        assert!(matches!(layer.setup(&bottom, &mut top), Err(NetError::Unsupported(_))));
    }

    #[test]
    fn test_cont_shape_mismatch() {
        let bottom = vec![sequence(3, 2, 2, 32), cont(2, 2, true)];
        let mut top = vec![Blob::default()];
        let mut layer = RecurrentLayer::new(param(RecurrentType::Lstm), &Device::reference()).unwrap();
        assert!(matches!(layer.setup(&bottom, &mut top), Err(NetError::ShapeMismatch(_))));
    }

    #[test]
    fn test_wrong_top_count() {
        let bottom = vec![sequence(3, 2, 2, 33), cont(3, 2, true)];
        let mut top = vec![Blob::default(), Blob::default()];
        let mut layer = RecurrentLayer::new(param(RecurrentType::Lstm), &Device::reference()).unwrap();
        assert!(matches!(
            layer.setup(&bottom, &mut top),
            Err(NetError::BlobCount { what: "top", .. })
        ));
    }

    #[test]
    fn test_cancelled_forward() {
        let cancel = CancelEvent::new();
        let bottom = vec![sequence(3, 1, 2, 34), cont(3, 1, true)];
        let mut top = vec![Blob::default()];
        let mut layer = RecurrentLayer::new(param(RecurrentType::Lstm), &Device::reference())
            .unwrap()
            .with_context(LayerContext::new().with_cancel(cancel.clone()))
            .unwrap();
        layer.setup(&bottom, &mut top).unwrap();
        layer.reshape(&bottom, &mut top).unwrap();

        cancel.set();
        assert!(matches!(layer.forward(&bottom, &top), Err(NetError::Cancelled)));
        cancel.reset();
        assert!(layer.forward(&bottom, &top).is_ok());
    }

    #[test]
    fn test_setup_twice_rejected() {
        let bottom = vec![sequence(2, 1, 2, 35), cont(2, 1, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Rnn), &bottom);
        assert!(layer.setup(&bottom, &mut top).is_err());
    }
}
