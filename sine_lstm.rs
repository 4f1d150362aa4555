use log::info;
use rust_recurrent_networks::blob::Blob;
use rust_recurrent_networks::config::{load_layer_config, LayerParameter, RecurrentParameter, RecurrentType};
use rust_recurrent_networks::device::Device;
use rust_recurrent_networks::fillers::FillerSpec;
use rust_recurrent_networks::layers::{InnerProductLayer, Layer};
use rust_recurrent_networks::optimizers::{Optimizer, SGD};
use rust_recurrent_networks::recurrent::RecurrentLayer;
use rust_recurrent_networks::utils::SimpleRng;
use rust_recurrent_networks::{NetError, Result};
use std::env;
use std::process;

// Next-value prediction on phase-shifted sine waves.
const TIMESTEPS: usize = 20;
const BATCH: usize = 4;
const HIDDEN: usize = 16;
const PHASE_STEP: f32 = 0.2;
// Offset between the sequences of one batch, in steps.
const SEQUENCE_OFFSET: usize = 7;
// Training hyperparameters.
const LEARNING_RATE: f32 = 0.05;
const MOMENTUM: f32 = 0.9;
const CLIP_NORM: f32 = 5.0;
const ITERATIONS: usize = 400;
const LOG_EVERY: usize = 50;

// LSTM followed by a linear readout to one value per timestep.
struct Model {
    lstm: RecurrentLayer,
    readout: InnerProductLayer,
    batch_first: bool,
    bottom: Vec<Blob>,
    hidden: Vec<Blob>,
    output: Vec<Blob>,
}

// Default layer settings, or the JSON file named by the first argument.
fn layer_param_from_args(args: &[String]) -> Result<LayerParameter> {
    let param = match args.get(1) {
        Some(path) => load_layer_config(path)?,
        None => {
            let mut p = RecurrentParameter::new(HIDDEN, RecurrentType::Lstm);
            p.weight_filler = FillerSpec::Uniform { min: -0.1, max: 0.1 };
            LayerParameter::new("lstm", p)
        }
    };
    let p = &param.recurrent_param;
    if p.expose_hidden_input || p.expose_hidden_output {
        return Err(NetError::InvalidConfig(
            "sine_lstm carries the hidden state itself; disable expose_hidden_*".to_string(),
        ));
    }
    Ok(param)
}

// Flat offset of (t, n) in a [T, N] or [N, T] layout.
fn offset(t: usize, n: usize, batch_first: bool) -> usize {
    if batch_first {
        n * TIMESTEPS + t
    } else {
        t * BATCH + n
    }
}

// Inputs, continuation flags and targets for chunk `chunk` of every sequence.
fn sine_batch(chunk: usize, batch_first: bool) -> (Vec<f32>, Vec<f32>, Vec<f32>) {
    let mut x = vec![0.0f32; TIMESTEPS * BATCH];
    let mut cont = vec![1.0f32; TIMESTEPS * BATCH];
    let mut target = vec![0.0f32; TIMESTEPS * BATCH];
    for n in 0..BATCH {
        for t in 0..TIMESTEPS {
            let step = chunk * TIMESTEPS + t + n * SEQUENCE_OFFSET;
            let i = offset(t, n, batch_first);
            x[i] = (step as f32 * PHASE_STEP).sin();
            target[i] = ((step + 1) as f32 * PHASE_STEP).sin();
        }
        if chunk == 0 {
            cont[offset(0, n, batch_first)] = 0.0;
        }
    }
    (x, cont, target)
}

// Wire the layers up for fixed-size batches.
fn build_model(param: LayerParameter, device: &Device, rng: &mut SimpleRng) -> Result<Model> {
    let batch_first = param.recurrent_param.batch_first;
    let bottom = if batch_first {
        vec![Blob::new(&[BATCH, TIMESTEPS, 1]), Blob::new(&[BATCH, TIMESTEPS])]
    } else {
        vec![Blob::new(&[TIMESTEPS, BATCH, 1]), Blob::new(&[TIMESTEPS, BATCH])]
    };
    let mut hidden = vec![Blob::default()];
    let mut lstm = RecurrentLayer::new(param, device)?;
    lstm.setup(&bottom, &mut hidden)?;
    lstm.reshape(&bottom, &mut hidden)?;

    let mut output = vec![Blob::default()];
    let mut readout = InnerProductLayer::new(1, 2, true, FillerSpec::Xavier, FillerSpec::zero(), rng.fork(1));
    readout.setup(&hidden, &mut output)?;
    readout.reshape(&hidden, &mut output)?;

    Ok(Model {
        lstm,
        readout,
        batch_first,
        bottom,
        hidden,
        output,
    })
}

// Half mean squared error; writes d(loss)/d(prediction) into the diff.
fn mse_loss_and_grad(prediction: &Blob, target: &[f32]) -> f32 {
    assert_eq!(prediction.count(), target.len(), "prediction/target size mismatch");
    let pred = prediction.data();
    let mut diff = prediction.diff_mut();
    let n = target.len() as f32;
    let mut loss = 0.0f32;
    for ((d, p), t) in diff.iter_mut().zip(pred.iter()).zip(target) {
        let e = p - t;
        loss += 0.5 * e * e;
        *d = e / n;
    }
    loss / n
}

fn forward(model: &mut Model, x: &[f32], cont: &[f32], target: &[f32]) -> Result<f32> {
    model.bottom[0].copy_data_from_slice(x);
    model.bottom[1].copy_data_from_slice(cont);
    model.lstm.forward(&model.bottom, &model.hidden)?;
    model.readout.forward(&model.hidden, &model.output)?;
    Ok(mse_loss_and_grad(&model.output[0], target))
}

fn all_params(model: &Model) -> Vec<Blob> {
    model
        .lstm
        .params()
        .iter()
        .chain(model.readout.params())
        .map(Blob::alias)
        .collect()
}

// One forward/backward/update step; returns the loss before the update.
fn train_step(model: &mut Model, optimizer: &mut SGD, x: &[f32], cont: &[f32], target: &[f32]) -> Result<f32> {
    let loss = forward(model, x, cont, target)?;
    model.readout.backward(&model.output, &[true], &model.hidden)?;
    model.lstm.backward(&model.hidden, &[false, false], &model.bottom)?;

    let params = all_params(model);
    optimizer.update(&params);
    for p in &params {
        p.set_diff(0.0);
    }
    Ok(loss)
}

// Train for `iterations` chunks and return the last loss.
fn run(args: &[String], iterations: usize) -> Result<f32> {
    let param = layer_param_from_args(args)?;
    let device = Device::reference();
    let mut rng = SimpleRng::new(param.random_seed);

    info!(
        "training {} with {} hidden units on {} chunks of {}x{}",
        param.name, param.recurrent_param.num_output, iterations, TIMESTEPS, BATCH
    );
    let mut model = build_model(param, &device, &mut rng)?;
    info!("backend: {:?}", model.lstm.backend_kind());
    let mut optimizer = SGD::new(LEARNING_RATE)
        .with_momentum(MOMENTUM)
        .with_clip_gradients(CLIP_NORM);

    let mut loss = 0.0;
    for chunk in 0..iterations {
        let (x, cont, target) = sine_batch(chunk, model.batch_first);
        loss = train_step(&mut model, &mut optimizer, &x, &cont, &target)?;
        if (chunk + 1) % LOG_EVERY == 0 {
            println!("Iteration {:4}: loss {:.6}", chunk + 1, loss);
        }
    }

    let (x, cont, target) = sine_batch(iterations, model.batch_first);
    let test_loss = forward(&mut model, &x, &cont, &target)?;
    println!("Held-out chunk loss: {:.6}", test_loss);
    let prediction = model.output[0].data_vec();
    for t in 0..5 {
        let i = offset(t, 0, model.batch_first);
        println!(
            "t={:2} input {:+.3} expected {:+.3} predicted {:+.3}",
            t, x[i], target[i], prediction[i]
        );
    }

    model.lstm.dispose();
    let stats = device.stats();
    info!(
        "device: {} allocations, {} frees, {} live bytes",
        stats.total_allocations, stats.total_frees, stats.live_bytes
    );
    Ok(loss)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args: Vec<String> = env::args().collect();
    if let Err(e) = run(&args, ITERATIONS) {
        eprintln!("sine_lstm: {}", e);
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sine_batch_continues_sequences() {
        let (_, cont0, target0) = sine_batch(0, false);
        let (x1, cont1, _) = sine_batch(1, false);

        // First chunk starts every sequence, later chunks continue them.
        assert!(cont0[..BATCH].iter().all(|&c| c == 0.0));
        assert!(cont1.iter().all(|&c| c == 1.0));
        // The last target of chunk 0 is the first input of chunk 1.
        for n in 0..BATCH {
            let last = offset(TIMESTEPS - 1, n, false);
            assert!((target0[last] - x1[offset(0, n, false)]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_batch_first_layout_matches_time_major() {
        let (x_tm, _, _) = sine_batch(2, false);
        let (x_bf, _, _) = sine_batch(2, true);
        for t in 0..TIMESTEPS {
            for n in 0..BATCH {
                assert_eq!(x_tm[offset(t, n, false)], x_bf[offset(t, n, true)]);
            }
        }
    }

    #[test]
    fn test_mse_loss_and_grad() {
        let prediction = Blob::from_data(&[2], vec![1.0, 0.0]);
        let loss = mse_loss_and_grad(&prediction, &[0.0, 0.0]);
        assert!((loss - 0.25).abs() < 1e-6);
        assert_eq!(prediction.diff_vec(), vec![0.5, 0.0]);
    }

    #[test]
    fn test_train_step_lowers_loss_on_same_batch() {
        let args = vec!["sine_lstm".to_string()];
        let param = layer_param_from_args(&args).unwrap();
        let device = Device::reference();
        let mut rng = SimpleRng::new(3);
        let mut model = build_model(param, &device, &mut rng).unwrap();
        let mut optimizer = SGD::new(0.01);

        // Chunk 0 resets every sequence, so both passes start from zero state.
        let (x, cont, target) = sine_batch(0, false);
        let before = train_step(&mut model, &mut optimizer, &x, &cont, &target).unwrap();
        let after = forward(&mut model, &x, &cont, &target).unwrap();
        assert!(after < before, "loss {} did not drop below {}", after, before);
    }

    #[test]
    fn test_run_short_training() {
        let args = vec!["sine_lstm".to_string()];
        let loss = run(&args, 3).unwrap();
        assert!(loss.is_finite());
    }
}
