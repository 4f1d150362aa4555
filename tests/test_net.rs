//! Tests for net construction and execution
//!
//! This file tests the net module including:
//! - Loading net descriptions from JSON
//! - Split insertion for blobs with several consumers
//! - Parameter sharing by name
//! - Loss computation and backward through a whole net
//! - Partial forward and backward ranges

use approx::assert_abs_diff_eq;
use rust_recurrent_networks::blob::Blob;
use rust_recurrent_networks::layers::Phase;
use rust_recurrent_networks::net::spec::{load_net_spec, LayerKind, LayerSpec, NetSpec};
use rust_recurrent_networks::net::splits::{split_blob_name, split_layer_name};
use rust_recurrent_networks::net::Net;
use rust_recurrent_networks::NetError;
use std::io::Write;
use tempfile::NamedTempFile;

fn input(shape: &[usize], name: &str) -> LayerSpec {
    LayerSpec::new(
        "input",
        LayerKind::Input {
            shapes: vec![shape.to_vec()],
            need_backward: vec![true],
        },
    )
    .tops(&[name])
}

fn fc(name: &str, num_output: usize, bottom: &str, top: &str) -> LayerSpec {
    LayerSpec::new(
        name,
        LayerKind::InnerProduct {
            num_output,
            bias_term: true,
            axis: 1,
            weight_filler: Default::default(),
            bias_filler: Default::default(),
        },
    )
    .bottoms(&[bottom])
    .tops(&[top])
}

fn loss(name: &str, bottom: &str) -> LayerSpec {
    LayerSpec::new(name, LayerKind::Reduction { coeff: 1.0 })
        .bottoms(&[bottom])
        .tops(&[format!("{}_value", name)])
        .loss_weight(1.0)
}

fn fill_input(net: &Net, values: &[f32]) -> Blob {
    let x = net.blob_by_name("x").unwrap().alias();
    x.copy_data_from_slice(values);
    x
}

// ============================================================================
// Loading Tests
// ============================================================================

mod loading_tests {
    use super::*;

    #[test]
    fn test_load_bundled_net() {
        let spec = load_net_spec("config/tiny_net.json").expect("Failed to load tiny net");
        assert_eq!(spec.layers.len(), 4);

        let mut net = Net::new(&spec, Phase::Train, None).unwrap();
        assert_eq!(net.param_names(), &["W", "b"]);
        assert_eq!(net.blob_by_name("z").unwrap().shape(), &[2, 4]);

        fill_input(&net, &[0.1, -0.2, 0.3, 0.4, 0.5, -0.6]);
        let value = net.forward().unwrap();
        let z_sum: f32 = net.blob_by_name("z").unwrap().data().iter().sum();
        assert_abs_diff_eq!(value, z_sum, epsilon = 1e-5);
    }

    #[test]
    fn test_load_rejects_unknown_bottom() {
        let json = r#"{
  "name": "broken",
  "layers": [
    { "name": "act", "type": "tanh", "bottoms": ["missing"], "tops": ["z"] }
  ]
}"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        let result = load_net_spec(file.path().to_str().unwrap());
        assert!(matches!(result, Err(NetError::InvalidConfig(_)) | Err(NetError::UnknownBlob(_))));
    }

    #[test]
    fn test_unknown_layer_type() {
        let json = r#"{ "name": "n", "layers": [ { "name": "a", "type": "softmax" } ] }"#;
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();
        assert!(matches!(
            load_net_spec(file.path().to_str().unwrap()),
            Err(NetError::Json(_))
        ));
    }
}

// ============================================================================
// Wiring Tests
// ============================================================================

mod wiring_tests {
    use super::*;

    #[test]
    fn test_split_inserted_for_fan_out() {
        let mut spec = NetSpec::new("fanout");
        spec.push(input(&[2, 3], "x"));
        spec.push(fc("a", 2, "x", "ya"));
        spec.push(fc("b", 2, "x", "yb"));
        spec.push(loss("la", "ya"));
        spec.push(loss("lb", "yb"));
        let net = Net::new(&spec, Phase::Train, None).unwrap();

        let split = split_layer_name("x", "input", 0);
        assert_eq!(net.layer_index(&split).unwrap(), 1);
        for k in 0..2 {
            let name = split_blob_name("x", "input", 0, k);
            assert!(net.blob_by_name(&name).unwrap().shares_data_with(net.blob_by_name("x").unwrap()));
        }
    }

    #[test]
    fn test_fan_out_gradients_sum() {
        let mut spec = NetSpec::new("fanout");
        spec.push(input(&[1, 2], "x"));
        spec.push(fc("a", 1, "x", "ya").params(&["W", "b"]));
        spec.push(fc("b", 1, "x", "yb").params(&["W", "b"]));
        spec.push(loss("la", "ya"));
        spec.push(loss("lb", "yb"));
        let mut net = Net::new(&spec, Phase::Train, None).unwrap();
        fill_input(&net, &[0.5, -1.0]);

        net.forward().unwrap();
        net.backward().unwrap();
        // Two identical branches: dx = 2 W, dW = 2 x, db = 2.
        let w = net.params()[0].data_vec();
        let dx = net.blob_by_name("x").unwrap().diff_vec();
        assert_abs_diff_eq!(dx[0], 2.0 * w[0], epsilon = 1e-6);
        assert_abs_diff_eq!(dx[1], 2.0 * w[1], epsilon = 1e-6);
        assert_eq!(net.params()[0].diff_vec(), vec![1.0, -2.0]);
        assert_eq!(net.params()[1].diff_vec(), vec![2.0]);
    }

    #[test]
    fn test_shared_parameter_shape_mismatch() {
        let mut spec = NetSpec::new("bad_share");
        spec.push(input(&[1, 2], "x"));
        spec.push(fc("a", 1, "x", "ya").params(&["W"]));
        spec.push(fc("b", 3, "x", "yb").params(&["W"]));
        assert!(matches!(
            Net::new(&spec, Phase::Train, None),
            Err(NetError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_share_params_with_external_blobs() {
        let spec = load_net_spec("config/tiny_net.json").unwrap();
        let mut net = Net::new(&spec, Phase::Train, None).unwrap();
        let external = vec![Blob::new(&[4, 3]), Blob::from_data(&[4], vec![0.5; 4])];
        net.share_params(&external).unwrap();

        fill_input(&net, &[1.0; 6]);
        net.forward().unwrap();
        let z = net.blob_by_name("z").unwrap().data_vec();
        assert!(z.iter().all(|&v| (v - 0.5f32.tanh()).abs() < 1e-6));

        assert!(net.share_params(&external[..1]).is_err());
    }
}

// ============================================================================
// Execution Tests
// ============================================================================

mod execution_tests {
    use super::*;

    #[test]
    fn test_backward_matches_finite_differences() {
        let spec = load_net_spec("config/tiny_net.json").unwrap();
        let mut net = Net::new(&spec, Phase::Train, None).unwrap();
        let values = [0.1, -0.2, 0.3, 0.4, 0.5, -0.6];
        let x = fill_input(&net, &values);

        net.forward().unwrap();
        net.backward().unwrap();
        let dx = x.diff_vec();

        let eps = 1e-2;
        for i in 0..values.len() {
            x.data_mut()[i] = values[i] + eps;
            let plus = net.forward().unwrap();
            x.data_mut()[i] = values[i] - eps;
            let minus = net.forward().unwrap();
            x.data_mut()[i] = values[i];
            assert_abs_diff_eq!(dx[i], (plus - minus) / (2.0 * eps), epsilon = 2e-3);
        }
    }

    #[test]
    fn test_partial_forward_stops_early() {
        let spec = load_net_spec("config/tiny_net.json").unwrap();
        let mut net = Net::new(&spec, Phase::Train, None).unwrap();
        fill_input(&net, &[1.0; 6]);

        let fc_index = net.layer_index("fc").unwrap();
        let value = net.forward_to(fc_index).unwrap();
        assert_eq!(value, 0.0);
        assert!(net.blob_by_name("y").unwrap().data().iter().any(|&v| v != 0.0));
        assert!(net.blob_by_name("z").unwrap().data().iter().all(|&v| v == 0.0));

        assert!(net.forward_to(net.num_layers()).is_err());
    }

    #[test]
    fn test_backward_from_intermediate_layer() {
        let spec = load_net_spec("config/tiny_net.json").unwrap();
        let mut net = Net::new(&spec, Phase::Train, None).unwrap();
        let x = fill_input(&net, &[0.2; 6]);
        let act = net.layer_index("act").unwrap();

        net.forward_to(act).unwrap();
        net.blob_by_name("z").unwrap().set_diff(1.0);
        net.backward_from(act).unwrap();
        let partial = x.diff_vec();

        net.clear_param_diffs();
        net.forward().unwrap();
        net.backward().unwrap();
        for (a, b) in partial.iter().zip(&x.diff_vec()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_batch_reshape_propagates() {
        let spec = load_net_spec("config/tiny_net.json").unwrap();
        let mut net = Net::new(&spec, Phase::Test, None).unwrap();
        net.blob_by_name_mut("x").unwrap().reshape(&[5, 3]);
        net.reshape().unwrap();
        assert_eq!(net.blob_by_name("z").unwrap().shape(), &[5, 4]);
        assert_eq!(net.phase(), Phase::Test);
    }
}
