//! Tests for the native backends of the recurrent layer
//!
//! Covers both the legacy descriptor API and the RNN8 API:
//! - Output shapes and the flat weight layout
//! - Descriptor reuse across reshapes and RNN8 reconfiguration counts
//! - Hidden state carry, reset and sequence restarts
//! - Stacked layers, exposed hidden state and phase restrictions
//! - Device memory and handle accounting, including disposal

use approx::assert_abs_diff_eq;
use rust_recurrent_networks::blob::Blob;
use rust_recurrent_networks::config::{Engine, LayerParameter, RecurrentParameter, RecurrentType};
use rust_recurrent_networks::device::Device;
use rust_recurrent_networks::layers::{Layer, Phase};
use rust_recurrent_networks::recurrent::{BackendKind, RecurrentLayer};
use rust_recurrent_networks::utils::SimpleRng;
use rust_recurrent_networks::NetError;

const HIDDEN: usize = 3;

fn param(kind: RecurrentType, rnn8: bool) -> LayerParameter {
    let mut p = RecurrentParameter::new(HIDDEN, kind);
    p.engine = Engine::Cudnn;
    p.use_cudnn_rnn8_if_supported = rnn8;
    LayerParameter::new("native", p)
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

fn ready_layer(p: LayerParameter, device: &Device, bottom: &[Blob], tops: usize) -> (RecurrentLayer, Vec<Blob>) {
    let mut top: Vec<Blob> = (0..tops).map(|_| Blob::default()).collect();
    let mut layer = RecurrentLayer::new(p, device).unwrap();
    layer.setup(bottom, &mut top).unwrap();
    layer.reshape(bottom, &mut top).unwrap();
    (layer, top)
}

// ============================================================================
// Shape and Weight Layout Tests
// ============================================================================

mod layout_tests {
    use super::*;

    #[test]
    fn test_legacy_lstm_shapes() {
        let bottom = vec![sequence(4, 2, 5, 1), cont(4, 2, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);

        assert_eq!(layer.backend_kind(), Some(BackendKind::NativeLegacy));
        assert_eq!(top[0].shape(), &[4, 2, HIDDEN]);
        layer.forward(&bottom, &top).unwrap();
        assert!(top[0].data_vec().iter().all(|v| v.is_finite() && v.abs() < 1.0));
    }

    #[test]
    fn test_rnn8_rnn_shapes() {
        let bottom = vec![sequence(3, 2, 4, 2), cont(3, 2, true)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Rnn, true), &Device::reference(), &bottom, 1);

        assert_eq!(layer.backend_kind(), Some(BackendKind::NativeRnn8));
        layer.forward(&bottom, &top).unwrap();
        assert_eq!(top[0].shape(), &[3, 2, HIDDEN]);
    }

    #[test]
    fn test_single_flat_weight_blob() {
        let bottom = vec![sequence(2, 1, 5, 3), cont(2, 1, true)];
        let (lstm, _) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);
        let (rnn, _) = ready_layer(param(RecurrentType::Rnn, true), &Device::reference(), &bottom, 1);

        // Input and recurrent matrices plus two bias vectors per gate.
        assert_eq!(lstm.params().len(), 1);
        assert_eq!(lstm.params()[0].count(), 4 * HIDDEN * (5 + HIDDEN) + 8 * HIDDEN);
        assert_eq!(rnn.params()[0].count(), HIDDEN * (5 + HIDDEN) + 2 * HIDDEN);
    }

    #[test]
    fn test_zero_bias_filler() {
        let bottom = vec![sequence(2, 1, 2, 4), cont(2, 1, true)];
        let (layer, _) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);

        let w = layer.params()[0].data_vec();
        let matrices = 4 * HIDDEN * (2 + HIDDEN);
        assert!(w[..matrices].iter().any(|&v| v != 0.0));
        assert!(w[matrices..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_both_apis_agree() {
        let bottom = vec![sequence(3, 2, 2, 5), cont(3, 2, true)];
        let (mut legacy, top_a) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);
        let (mut rnn8, top_b) = ready_layer(param(RecurrentType::Lstm, true), &Device::reference(), &bottom, 1);

        rnn8.params()[0].copy_data_from_slice(&legacy.params()[0].data());
        legacy.forward(&bottom, &top_a).unwrap();
        rnn8.forward(&bottom, &top_b).unwrap();
        for (a, b) in top_a[0].data_vec().iter().zip(&top_b[0].data_vec()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }
}

// ============================================================================
// Reshape and Descriptor Tests
// ============================================================================

mod reshape_tests {
    use super::*;

    #[test]
    fn test_same_shape_keeps_descriptors() {
        let bottom = vec![sequence(3, 2, 2, 10), cont(3, 2, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);
        let ids = layer.native_handle_ids().unwrap();
        let rebuilds = layer.rebuild_count();

        let moved = vec![bottom[0].duplicate(), bottom[1].duplicate()];
        assert!(layer.reshape_needed(&moved));
        layer.reshape(&moved, &mut top).unwrap();
        assert_eq!(layer.native_handle_ids().unwrap(), ids);
        assert_eq!(layer.rebuild_count(), rebuilds);
    }

    #[test]
    fn test_timestep_change_recreates_input_descriptor() {
        let bottom = vec![sequence(3, 2, 2, 11), cont(3, 2, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);
        assert_eq!(layer.rebuild_count(), 1);
        let ids = layer.native_handle_ids().unwrap();

        let longer = vec![sequence(6, 2, 2, 12), cont(6, 2, true)];
        layer.reshape(&longer, &mut top).unwrap();
        let new_ids = layer.native_handle_ids().unwrap();
        assert_eq!(new_ids[0], ids[0]);
        assert_ne!(new_ids, ids);
        assert_eq!(layer.rebuild_count(), 2);
        assert_eq!(top[0].shape(), &[6, 2, HIDDEN]);
    }

    #[test]
    fn test_rnn8_reconfigurations() {
        let bottom = vec![sequence(3, 2, 2, 13), cont(3, 2, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Rnn, true), &Device::reference(), &bottom, 1);

        // Setup configures once; the first reshape only sizes the buffers.
        assert_eq!(layer.rnn8_reconfigurations(), Some(1));
        assert_eq!(layer.rebuild_count(), 1);

        let same = vec![bottom[0].duplicate(), bottom[1].duplicate()];
        layer.reshape(&same, &mut top).unwrap();
        assert_eq!(layer.rnn8_reconfigurations(), Some(1));

        let longer = vec![sequence(5, 2, 2, 14), cont(5, 2, true)];
        layer.reshape(&longer, &mut top).unwrap();
        assert_eq!(layer.rnn8_reconfigurations(), Some(2));
        assert_eq!(layer.rebuild_count(), 2);
        layer.forward(&longer, &top).unwrap();
    }

    #[test]
    fn test_input_width_change_rejected() {
        let bottom = vec![sequence(3, 2, 2, 15), cont(3, 2, true)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm, true), &Device::reference(), &bottom, 1);

        let wider = vec![sequence(3, 2, 4, 16), cont(3, 2, true)];
        assert!(matches!(layer.reshape(&wider, &mut top), Err(NetError::ShapeMismatch(_))));
    }

    #[test]
    fn test_legacy_has_no_rnn8_counter() {
        let bottom = vec![sequence(2, 1, 2, 17), cont(2, 1, true)];
        let (layer, _) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);
        assert_eq!(layer.rnn8_reconfigurations(), None);
        assert!(layer.unrolled_net().is_none());
    }
}

// ============================================================================
// Recurrent State Tests
// ============================================================================

mod state_tests {
    use super::*;

    #[test]
    fn test_state_carried_between_batches() {
        for rnn8 in [false, true] {
            let first = vec![sequence(3, 2, 2, 20), cont(3, 2, true)];
            let second = vec![sequence(3, 2, 2, 21), cont(3, 2, false)];
            let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm, rnn8), &Device::reference(), &first, 1);

            layer.forward(&first, &top).unwrap();
            let carried: Vec<Vec<f32>> = layer.final_state().unwrap().iter().map(Blob::data_vec).collect();
            assert_eq!(carried.len(), 2);
            assert!(carried[0].iter().any(|&v| v != 0.0));

            layer.reshape(&second, &mut top).unwrap();
            layer.forward(&second, &top).unwrap();
            let initial: Vec<Vec<f32>> = layer.initial_state().unwrap().iter().map(Blob::data_vec).collect();
            assert_eq!(initial, carried);
        }
    }

    #[test]
    fn test_reset_zeroes_state() {
        let bottom = vec![sequence(3, 2, 2, 22), cont(3, 2, false)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Rnn, false), &Device::reference(), &bottom, 1);

        layer.forward(&bottom, &top).unwrap();
        layer.reset().unwrap();
        for blob in layer.final_state().unwrap() {
            assert!(blob.data_vec().iter().all(|&v| v == 0.0));
        }
        layer.forward(&bottom, &top).unwrap();
        for blob in layer.initial_state().unwrap() {
            assert!(blob.data_vec().iter().all(|&v| v == 0.0));
        }
    }

    #[test]
    fn test_restart_rows_only() {
        let bottom = vec![sequence(3, 2, 2, 23), cont(3, 2, false)];
        let (mut layer, top) = ready_layer(param(RecurrentType::Lstm, false), &Device::reference(), &bottom, 1);
        layer.forward(&bottom, &top).unwrap();

        // Restart row 0 only; row 1 keeps its state.
        bottom[1].data_mut()[0] = 0.0;
        layer.forward(&bottom, &top).unwrap();
        let hx = layer.initial_state().unwrap()[0].data_vec();
        assert!(hx[..HIDDEN].iter().all(|&v| v == 0.0));
        assert!(hx[HIDDEN..].iter().any(|&v| v != 0.0));
    }

    #[test]
    fn test_batch_change_resets_state() {
        let small = vec![sequence(2, 1, 2, 24), cont(2, 1, false)];
        let (mut layer, mut top) = ready_layer(param(RecurrentType::Lstm, true), &Device::reference(), &small, 1);
        layer.forward(&small, &top).unwrap();

        let large = vec![sequence(2, 3, 2, 25), cont(2, 3, false)];
        layer.reshape(&large, &mut top).unwrap();
        layer.forward(&large, &top).unwrap();
        let hx = layer.initial_state().unwrap()[0].alias();
        assert_eq!(hx.shape(), &[1, 3, HIDDEN]);
        assert!(hx.data_vec().iter().all(|&v| v == 0.0));
    }
}

// ============================================================================
// Stacked Layers and Exposed State Tests
// ============================================================================

mod stacked_tests {
    use super::*;

    #[test]
    fn test_stacked_layers_with_dropout() {
        for rnn8 in [false, true] {
            let mut p = param(RecurrentType::Lstm, rnn8);
            p.recurrent_param.num_layers = 2;
            p.recurrent_param.dropout_ratio = 0.3;
            let bottom = vec![sequence(4, 2, 3, 30), cont(4, 2, true)];
            let (mut layer, top) = ready_layer(p, &Device::reference(), &bottom, 1);

            layer.forward(&bottom, &top).unwrap();
            assert_eq!(top[0].shape(), &[4, 2, HIDDEN]);
            assert!(top[0].data_vec().iter().all(|v| v.is_finite()));
            assert_eq!(layer.final_state().unwrap()[0].shape(), &[2, 2, HIDDEN]);

            top[0].set_diff(1.0);
            layer.backward(&top, &[true, false], &bottom).unwrap();
            assert!(layer.params()[0].sumsq_diff() > 0.0);
        }
    }

    fn dropout_param(rnn8: bool) -> LayerParameter {
        let mut p = param(RecurrentType::Lstm, rnn8);
        p.recurrent_param.num_layers = 2;
        p.recurrent_param.dropout_ratio = 0.3;
        p.recurrent_param.dropout_seed = 7;
        p
    }

    // Loss of the first forward of a fresh layer, so the dropout mask is
    // drawn from the same seed every time.
    fn fresh_loss(p: &LayerParameter, weights: &Blob, bottom: &[Blob], coeffs: &[f32]) -> f32 {
        let mut top = vec![Blob::default()];
        let mut layer = RecurrentLayer::new(p.clone(), &Device::reference())
            .unwrap()
            .with_params(vec![weights.duplicate()]);
        layer.setup(bottom, &mut top).unwrap();
        layer.reshape(bottom, &mut top).unwrap();
        layer.forward(bottom, &top).unwrap();
        let y = top[0].data();
        y.iter().zip(coeffs).map(|(a, b)| a * b).sum()
    }

    #[test]
    fn test_stacked_dropout_gradients() {
        const EPSILON: f32 = 1e-2;
        for rnn8 in [false, true] {
            let p = dropout_param(rnn8);
            let bottom = vec![sequence(3, 2, 3, 33), cont(3, 2, true)];
            let (mut layer, top) = ready_layer(p.clone(), &Device::reference(), &bottom, 1);
            let weights = layer.params()[0].duplicate();
            let coeffs: Vec<f32> = (0..top[0].count()).map(|k| (k as f32 * 0.7 + 0.3).sin()).collect();

            layer.forward(&bottom, &top).unwrap();
            top[0].copy_diff_from_slice(&coeffs);
            layer.backward(&top, &[true, false], &bottom).unwrap();
            let dw = layer.params()[0].diff_vec();
            let dx = bottom[0].diff_vec();

            let targets = [(&weights, dw), (&bottom[0], dx)];
            for (blob, analytic) in targets {
                let step = (blob.count() / 11).max(1);
                for index in (0..blob.count()).step_by(step) {
                    let original = blob.data()[index];
                    blob.data_mut()[index] = original + EPSILON;
                    let plus = fresh_loss(&p, &weights, &bottom, &coeffs);
                    blob.data_mut()[index] = original - EPSILON;
                    let minus = fresh_loss(&p, &weights, &bottom, &coeffs);
                    blob.data_mut()[index] = original;
                    let numeric = (plus - minus) / (2.0 * EPSILON);
                    let tolerance = 1e-2 * analytic[index].abs().max(numeric.abs()) + 2e-3;
                    assert!(
                        (analytic[index] - numeric).abs() <= tolerance,
                        "rnn8={} [{}]: analytic {} vs numeric {}",
                        rnn8,
                        index,
                        analytic[index],
                        numeric
                    );
                }
            }
        }
    }

    #[test]
    fn test_exposed_state_round_trip() {
        let mut p = param(RecurrentType::Lstm, false);
        p.recurrent_param.expose_hidden_input = true;
        p.recurrent_param.expose_hidden_output = true;
        let h0 = Blob::from_data(&[1, 2, HIDDEN], vec![0.1, -0.2, 0.3, 0.4, -0.5, 0.6]);
        let c0 = Blob::from_data(&[1, 2, HIDDEN], vec![0.0, 0.2, -0.1, 0.3, 0.1, -0.3]);
        let bottom = vec![sequence(3, 2, 2, 31), cont(3, 2, false), h0.alias(), c0.alias()];
        let (mut layer, top) = ready_layer(p, &Device::reference(), &bottom, 3);

        layer.forward(&bottom, &top).unwrap();
        assert_eq!(top[1].shape(), &[1, 2, HIDDEN]);
        assert_eq!(top[2].shape(), &[1, 2, HIDDEN]);
        let initial = layer.initial_state().unwrap();
        assert_eq!(initial[0].data_vec(), h0.data_vec());
        assert_eq!(initial[1].data_vec(), c0.data_vec());

        top[0].set_diff(1.0);
        top[1].set_diff(0.5);
        layer.backward(&top, &[true, false, true, true], &bottom).unwrap();
        assert!(h0.diff_vec().iter().any(|&d| d != 0.0));
        assert!(c0.diff_vec().iter().any(|&d| d != 0.0));
    }

    #[test]
    fn test_restarted_rows_get_no_state_gradient() {
        let mut p = param(RecurrentType::Rnn, true);
        p.recurrent_param.expose_hidden_input = true;
        let h0 = Blob::from_data(&[1, 2, HIDDEN], vec![0.5; 2 * HIDDEN]);
        let c = cont(2, 2, false);
        c.data_mut()[1] = 0.0;
        let bottom = vec![sequence(2, 2, 2, 32), c, h0.alias()];
        let (mut layer, top) = ready_layer(p, &Device::reference(), &bottom, 1);

        layer.forward(&bottom, &top).unwrap();
        top[0].set_diff(1.0);
        layer.backward(&top, &[true, false, true], &bottom).unwrap();
        let dh = h0.diff_vec();
        assert!(dh[..HIDDEN].iter().any(|&d| d != 0.0));
        assert!(dh[HIDDEN..].iter().all(|&d| d == 0.0));
    }
}

// ============================================================================
// Restriction Tests
// ============================================================================

mod restriction_tests {
    use super::*;

    #[test]
    fn test_inference_phase_forward_only() {
        let p = param(RecurrentType::Lstm, true).with_phase(Phase::Test);
        let bottom = vec![sequence(3, 2, 2, 40), cont(3, 2, true)];
        let (mut layer, top) = ready_layer(p, &Device::reference(), &bottom, 1);
        assert_eq!(layer.phase(), Phase::Test);

        layer.forward(&bottom, &top).unwrap();
        top[0].set_diff(1.0);
        assert!(matches!(
            layer.backward(&top, &[true, false], &bottom),
            Err(NetError::Unsupported(_))
        ));
    }

    #[test]
    fn test_empty_sequence_rejected() {
        for rnn8 in [false, true] {
            for (t, n) in [(0, 2), (2, 0)] {
                let bottom = vec![Blob::new(&[t, n, 2]), Blob::new(&[t, n])];
                let mut top = vec![Blob::default()];
                let mut layer = RecurrentLayer::new(param(RecurrentType::Lstm, rnn8), &Device::reference()).unwrap();
                assert!(matches!(layer.setup(&bottom, &mut top), Err(NetError::ShapeMismatch(_))));
            }
        }
    }

    #[test]
    fn test_static_input_rejected() {
        let bottom = vec![sequence(3, 2, 2, 41), cont(3, 2, true), Blob::new(&[2, 4])];
        let mut top = vec![Blob::default()];
        let mut layer = RecurrentLayer::new(param(RecurrentType::Lstm, false), &Device::reference()).unwrap();
        assert!(matches!(layer.setup(&bottom, &mut top), Err(NetError::Unsupported(_))));
    }

    #[test]
    fn test_out_of_device_memory() {
        let device = Device::reference().with_memory_limit(16);
        let bottom = vec![sequence(3, 2, 2, 42), cont(3, 2, true)];
        let mut top = vec![Blob::default()];
        let mut layer = RecurrentLayer::new(param(RecurrentType::Lstm, false), &device).unwrap();
        layer.setup(&bottom, &mut top).unwrap();
        assert!(matches!(
            layer.reshape(&bottom, &mut top),
            Err(NetError::OutOfMemory { .. })
        ));
    }
}

// ============================================================================
// Resource Accounting Tests
// ============================================================================

mod resource_tests {
    use super::*;

    #[test]
    fn test_dispose_releases_everything() {
        for rnn8 in [false, true] {
            let device = Device::reference();
            let mut p = param(RecurrentType::Lstm, rnn8);
            p.recurrent_param.num_layers = 2;
            p.recurrent_param.dropout_ratio = 0.2;
            let bottom = vec![sequence(3, 2, 2, 50), cont(3, 2, true)];
            let (mut layer, top) = ready_layer(p, &device, &bottom, 1);
            layer.forward(&bottom, &top).unwrap();
            assert!(device.stats().live_allocations > 0);
            assert!(device.stats().live_handles > 0);

            layer.dispose();
            let stats = device.stats();
            assert_eq!(stats.live_allocations, 0);
            assert_eq!(stats.live_bytes, 0);
            assert_eq!(stats.total_frees, stats.total_allocations);
            assert_eq!(stats.live_handles, 0);
            assert!(matches!(layer.forward(&bottom, &top), Err(NetError::Disposed)));
        }
    }

    #[test]
    fn test_drop_releases_everything() {
        let device = Device::reference();
        {
            let bottom = vec![sequence(2, 1, 2, 51), cont(2, 1, true)];
            let (mut layer, top) = ready_layer(param(RecurrentType::Rnn, false), &device, &bottom, 1);
            layer.forward(&bottom, &top).unwrap();
        }
        assert_eq!(device.stats().live_allocations, 0);
        assert_eq!(device.stats().live_handles, 0);
    }

    #[test]
    fn test_inference_allocates_no_reserve() {
        let train_device = Device::reference();
        let test_device = Device::reference();
        let bottom = vec![sequence(3, 2, 2, 52), cont(3, 2, true)];
        let (_train, _) = ready_layer(param(RecurrentType::Lstm, false), &train_device, &bottom, 1);
        let (_test, _) = ready_layer(
            param(RecurrentType::Lstm, false).with_phase(Phase::Test),
            &test_device,
            &bottom,
            1,
        );
        assert_eq!(train_device.stats().live_allocations, 2);
        assert_eq!(test_device.stats().live_allocations, 1);
        assert!(test_device.stats().live_bytes < train_device.stats().live_bytes);
    }
}
