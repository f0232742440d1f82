use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use stagenet::stage::kinds::{MemoryData, Split};
use stagenet::{
    DeviceRef, ExecutionContext, ExecutionMode, Graph, InputSpec, NetDescription, NetError,
    Phase, Propagation, Stage, StageSpec, Tensor,
};
use stagenet_device_ref::RefDevice;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn fc_net(batch: i64) -> NetDescription {
    NetDescription::new("fc")
        .with_input(InputSpec::new("data", &[batch, 3]))
        .with_stage(
            StageSpec::new("fc", "InnerProduct")
                .with_inputs(["data"])
                .with_outputs(["out"])
                .with_loss_weights(&[1.0])
                .with_config(json!({"num_output": 1, "bias_term": false})),
        )
}

#[test]
fn fully_connected_forward_and_weight_gradient_are_exact() -> Result<()> {
    let mut graph = Graph::<f64>::new(&fc_net(2), ExecutionContext::default())?;
    assert_eq!(graph.params().len(), 1);
    graph.param(0).expect("weight").set_values(&[0.5, -1.0, 2.0])?;

    let x = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let loss = graph.forward(&[&x[..]])?;
    let out = graph.tensor_by_name("out").expect("output");
    assert_eq!(out.shape().dims(), &[2, 1]);
    assert_eq!(&*out.values()?, &[4.5, 9.0]);
    assert_eq!(loss, 13.5);

    graph.backward()?;
    // dW = dY^T X with dY = 1: the column sums of X.
    let weight = graph.param(0).expect("weight");
    assert_eq!(&*weight.grads()?, &[5.0, 7.0, 9.0]);
    Ok(())
}

#[test]
fn single_row_weight_gradient_is_the_input() -> Result<()> {
    let mut graph = Graph::<f64>::new(&fc_net(1), ExecutionContext::default())?;
    graph.param(0).expect("weight").set_values(&[1.0, 1.0, 1.0])?;
    let x = [0.25, -3.0, 8.0];
    graph.forward_backward(&[&x[..]])?;
    assert_eq!(&*graph.param(0).expect("weight").grads()?, &x);
    Ok(())
}

#[test]
fn split_sums_consumer_gradients() -> Result<()> {
    let input = Tensor::<f32>::with_shape(&[3], None)?;
    input.set_values(&[1.0, 2.0, 3.0])?;
    let (a, b) = (Tensor::<f32>::new(None), Tensor::<f32>::new(None));
    let mut split = Split;
    let shapes = <Split as Stage<f32>>::configure(&mut split, &[input.shape()], 2)?;
    a.reshape_to(&shapes[0])?;
    b.reshape_to(&shapes[1])?;

    split.forward_host(&[&input], &[&a, &b])?;
    assert_eq!(&*a.values()?, &[1.0, 2.0, 3.0]);
    assert_eq!(&*b.values()?, &[1.0, 2.0, 3.0]);

    a.grads_mut()?.fill(1.0);
    b.grads_mut()?.fill(2.0);
    split.backward_host(&[&a, &b], &Propagation::new(&[true], &[]), &[&input])?;
    assert_eq!(&*input.grads()?, &[3.0, 3.0, 3.0]);
    Ok(())
}

fn conv_net() -> NetDescription {
    NetDescription::new("conv")
        .with_input(InputSpec::new("data", &[2, 1, 4, 4]))
        .with_input(InputSpec::new("label", &[2]))
        .with_stage(
            StageSpec::new("conv1", "Convolution")
                .with_inputs(["data"])
                .with_outputs(["conv1"])
                .with_config(json!({
                    "num_output": 2,
                    "kernel_size": 3,
                    "pad": 1,
                    "weight_filler": {"type": "gaussian", "std": 0.5},
                    "bias_filler": {"type": "constant", "value": 0.1}
                })),
        )
        .with_stage(
            StageSpec::new("relu1", "ReLU")
                .with_inputs(["conv1"])
                .with_outputs(["conv1"]),
        )
        .with_stage(
            StageSpec::new("ip1", "InnerProduct")
                .with_inputs(["conv1"])
                .with_outputs(["ip1"])
                .with_config(json!({"num_output": 3, "weight_filler": {"type": "xavier"}})),
        )
        .with_stage(
            StageSpec::new("loss", "SoftmaxWithLoss")
                .with_inputs(["ip1", "label"])
                .with_outputs(["loss"]),
        )
}

#[test]
fn every_parameter_gradient_matches_its_values() -> Result<()> {
    init_tracing();
    let mut graph = Graph::<f32>::new(&conv_net(), ExecutionContext::host(Phase::Train, 3))?;
    let data: Vec<f32> = (0..32).map(|i| (i as f32 * 0.37).sin()).collect();
    let loss = graph.forward_backward(&[&data[..], &[0.0, 2.0][..]])?;
    assert!(loss.is_finite() && loss > 0.0);

    assert_eq!(graph.params().len(), 4);
    for (entry, tensor) in graph.learnable_params() {
        assert_eq!(tensor.grads()?.len(), tensor.count(), "{}", entry.stage);
        assert!(tensor.sum_abs_grads()? > 0.0, "{} got no gradient", entry.stage);
    }
    assert_eq!(graph.output_names(), ["loss"]);
    assert_eq!(graph.loss_weights("loss"), Some(&[1.0f32][..]));
    assert!(graph.memory_used_bytes() >= (32 + 2 + 64 + 6 + 1) * 4);
    Ok(())
}

#[test]
fn training_steps_reduce_the_loss() -> Result<()> {
    let mut graph = Graph::<f32>::new(&conv_net(), ExecutionContext::host(Phase::Train, 11))?;
    let data: Vec<f32> = (0..32).map(|i| (i as f32 * 0.61).cos()).collect();
    let labels = [1.0, 0.0];
    let first = graph.forward(&[&data[..], &labels[..]])?;
    for _ in 0..20 {
        graph.zero_param_gradients()?;
        graph.forward_backward(&[&data[..], &labels[..]])?;
        for (_, tensor) in graph.learnable_params() {
            tensor.scale_grads(0.1)?;
        }
        graph.update()?;
    }
    let last = graph.forward(&[&data[..], &labels[..]])?;
    assert!(last < first, "loss went from {first} to {last}");
    Ok(())
}

fn fan_out_net() -> NetDescription {
    NetDescription::new("fan_out")
        .with_input(InputSpec::new("data", &[2, 3]))
        .with_input(InputSpec::new("label", &[2]))
        .with_stage(
            StageSpec::new("fc1", "InnerProduct")
                .with_inputs(["data"])
                .with_outputs(["h"])
                .with_config(json!({"num_output": 4, "weight_filler": {"type": "xavier"}})),
        )
        .with_stage(StageSpec::new("relu1", "ReLU").with_inputs(["h"]).with_outputs(["h"]))
        .with_stage(
            StageSpec::new("fc_a", "InnerProduct")
                .with_inputs(["h"])
                .with_outputs(["a"])
                .with_config(json!({"num_output": 3, "weight_filler": {"type": "gaussian", "std": 0.3}})),
        )
        .with_stage(
            StageSpec::new("fc_b", "InnerProduct")
                .with_inputs(["h"])
                .with_outputs(["b"])
                .with_config(json!({"num_output": 3, "weight_filler": {"type": "gaussian", "std": 0.3}})),
        )
        .with_stage(
            StageSpec::new("join", "Concat")
                .with_inputs(["a", "b"])
                .with_outputs(["logits"]),
        )
        .with_stage(
            StageSpec::new("loss", "SoftmaxWithLoss")
                .with_inputs(["logits", "label"])
                .with_outputs(["loss"]),
        )
}

#[test]
fn device_mode_matches_host_execution() -> Result<()> {
    init_tracing();
    let dev = Arc::new(RefDevice::<f64>::new());
    let handle: DeviceRef<f64> = dev.clone();
    let device_ctx =
        ExecutionContext::with_device(Phase::Train, 5, handle).with_mode(ExecutionMode::Device)?;
    let mut on_device = Graph::<f64>::new(&fan_out_net(), device_ctx)?;
    let mut on_host = Graph::<f64>::new(&fan_out_net(), ExecutionContext::host(Phase::Train, 5))?;
    assert!(on_device.stage_names().any(|name| name.ends_with("_split")));

    let data = [0.4, -1.3, 0.8, 2.1, 0.05, -0.6];
    let labels = [4.0, 1.0];
    let host_loss = on_host.forward_backward(&[&data[..], &labels[..]])?;
    let device_loss = on_device.forward_backward(&[&data[..], &labels[..]])?;
    assert!((host_loss - device_loss).abs() < 1e-12, "{host_loss} vs {device_loss}");
    assert!(dev.uploads() > 0);

    assert_eq!(on_host.params().len(), on_device.params().len());
    for id in 0..on_host.params().len() {
        let expected = on_host.param(id).expect("host param").grads()?.to_vec();
        let actual = on_device.param(id).expect("device param").grads()?.to_vec();
        assert_eq!(expected.len(), actual.len());
        for (e, a) in expected.iter().zip(&actual) {
            assert!((e - a).abs() < 1e-12, "param {id}: host {e}, device {a}");
        }
        assert!(expected.iter().any(|g| *g != 0.0), "param {id} got no gradient");
    }
    Ok(())
}

#[test]
fn slice_concat_and_mvn_backpropagate_to_inputs() -> Result<()> {
    let desc = NetDescription {
        force_backward: true,
        ..NetDescription::new("pieces")
            .with_input(InputSpec::new("data", &[2, 4]))
            .with_input(InputSpec::new("target", &[2, 4]))
            .with_stage(
                StageSpec::new("slice", "Slice")
                    .with_inputs(["data"])
                    .with_outputs(["head", "tail"])
                    .with_config(json!({"axis": 1, "slice_point": [1]})),
            )
            .with_stage(
                StageSpec::new("mvn", "MVN")
                    .with_inputs(["tail"])
                    .with_outputs(["tail_n"])
                    .with_config(json!({"across_channels": true})),
            )
            .with_stage(
                StageSpec::new("concat", "Concat")
                    .with_inputs(["head", "tail_n"])
                    .with_outputs(["joined"]),
            )
            .with_stage(
                StageSpec::new("leaky", "ReLU")
                    .with_inputs(["joined"])
                    .with_outputs(["joined"])
                    .with_config(json!({"negative_slope": 0.1})),
            )
            .with_stage(
                StageSpec::new("loss", "EuclideanLoss")
                    .with_inputs(["joined", "target"])
                    .with_outputs(["loss"]),
            )
    };
    let mut graph = Graph::<f64>::new(&desc, ExecutionContext::default())?;
    let data = [0.3, -1.2, 2.5, 0.7, 1.1, -0.4, 0.9, -2.0];
    let target = [0.5, 0.1, -0.3, 0.2, -0.7, 0.4, 0.0, 1.0];
    graph.forward_backward(&[&data[..], &target[..]])?;
    let analytic = graph.inputs()[0].grads()?.to_vec();

    let h = 1e-6;
    for i in 0..data.len() {
        let mut plus = data;
        plus[i] += h;
        let mut minus = data;
        minus[i] -= h;
        let up = graph.forward(&[&plus[..], &target[..]])?;
        let down = graph.forward(&[&minus[..], &target[..]])?;
        let numeric = (up - down) / (2.0 * h);
        assert!(
            (numeric - analytic[i]).abs() < 1e-5,
            "d/d data[{i}]: numeric {numeric}, analytic {}",
            analytic[i]
        );
    }
    Ok(())
}

#[test]
fn memory_data_feeds_batches_through_the_graph() -> Result<()> {
    let desc = NetDescription::new("memory")
        .with_stage(
            StageSpec::new("source", "MemoryData")
                .with_outputs(["data", "label"])
                .with_config(json!({"batch_size": 2, "channels": 1, "height": 1, "width": 3})),
        )
        .with_stage(
            StageSpec::new("ip", "InnerProduct")
                .with_inputs(["data"])
                .with_outputs(["scores"])
                .with_config(json!({"num_output": 3, "weight_filler": {"type": "uniform", "min": -0.5, "max": 0.5}})),
        )
        .with_stage(
            StageSpec::new("loss", "SoftmaxWithLoss")
                .with_inputs(["scores", "label"])
                .with_outputs(["loss"]),
        );
    let mut graph = Graph::<f32>::new(&desc, ExecutionContext::default())?;
    assert!(matches!(
        graph.forward_prefilled(),
        Err(NetError::Graph { .. })
    ));

    let data: Vec<f32> = (0..12).map(|i| i as f32 / 12.0).collect();
    graph
        .stage_as_mut::<MemoryData<f32>>("source")
        .expect("memory source")
        .reset(data, vec![0.0, 1.0, 2.0, 0.0], 4)?;

    graph.forward_prefilled()?;
    assert_eq!(&*graph.tensor_by_name("label").expect("label").values()?, &[0.0, 1.0]);
    graph.forward_prefilled()?;
    assert_eq!(&*graph.tensor_by_name("label").expect("label").values()?, &[2.0, 0.0]);
    let source = graph.stage_as::<MemoryData<f32>>("source").expect("memory source");
    assert_eq!(source.position(), 0);
    assert!(graph.stage_as::<Split>("source").is_none());

    graph.backward()?;
    assert_eq!(graph.stage_needs_backward("source"), Some(false));
    assert_eq!(graph.input_needs_backward("loss"), Some(&[true, false][..]));
    Ok(())
}

#[test]
fn dummy_data_with_debug_info() -> Result<()> {
    init_tracing();
    let desc = NetDescription {
        debug_info: true,
        ..NetDescription::new("dummy")
            .with_stage(
                StageSpec::new("source", "DummyData")
                    .with_outputs(["x", "y"])
                    .with_config(json!({
                        "shape": [[3, 2], [3, 4]],
                        "data_filler": [{"type": "gaussian"}, {"type": "constant", "value": 0.5}]
                    })),
            )
            .with_stage(
                StageSpec::new("fc", "InnerProduct")
                    .with_inputs(["x"])
                    .with_outputs(["fx"])
                    .with_config(json!({"num_output": 4, "weight_filler": {"type": "msra"}})),
            )
            .with_stage(
                StageSpec::new("loss", "EuclideanLoss")
                    .with_inputs(["fx", "y"])
                    .with_outputs(["loss"]),
            )
    };
    let mut graph = Graph::<f64>::new(&desc, ExecutionContext::host(Phase::Train, 5))?;
    let first = graph.forward_prefilled()?;
    let x_before = graph.tensor_by_name("x").expect("x").values()?.to_vec();
    let second = graph.forward_prefilled()?;
    let x_after = graph.tensor_by_name("x").expect("x").values()?.to_vec();
    assert_ne!(x_before, x_after, "gaussian outputs are redrawn each forward");
    assert_ne!(first, second);
    assert_eq!(&*graph.tensor_by_name("y").expect("y").values()?, &[0.5; 12]);
    graph.backward()?;
    Ok(())
}

#[test]
fn partial_runs_cover_stage_ranges() -> Result<()> {
    let mut graph = Graph::<f32>::new(&conv_net(), ExecutionContext::host(Phase::Train, 3))?;
    let data: Vec<f32> = (0..32).map(|i| i as f32 / 32.0).collect();
    graph.set_input(0, &data)?;
    graph.set_input(1, &[1.0, 1.0])?;
    let names: Vec<&str> = graph.stage_names().collect();
    assert_eq!(names, ["conv1", "relu1", "ip1", "loss"]);

    assert_eq!(graph.forward_from_to(0, 2)?, 0.0);
    let loss = graph.forward_from_to(3, 3)?;
    assert_eq!(loss, graph.forward_prefilled()?);

    graph.backward_from_to(3, 2)?;
    assert!(graph.param(2).expect("ip1 weight").sum_abs_grads()? > 0.0);
    assert_eq!(graph.param(0).expect("conv1 weight").sum_abs_grads()?, 0.0);

    assert!(graph.forward_from_to(2, 9).is_err());
    assert!(graph.backward_from_to(1, 2).is_err());
    assert!(matches!(graph.forward(&[&data[..]]), Err(NetError::Graph { .. })));
    Ok(())
}

#[test]
fn reshape_propagates_new_batch_size() -> Result<()> {
    let mut graph = Graph::<f64>::new(&fc_net(2), ExecutionContext::default())?;
    graph.inputs()[0].reshape(&[4, 3])?;
    graph.reshape()?;
    assert_eq!(graph.tensor_by_name("out").expect("out").shape().dims(), &[4, 1]);
    let x = [1.0; 12];
    graph.forward(&[&x[..]])?;
    Ok(())
}

#[test]
fn adopted_inputs_are_used_without_copy() -> Result<()> {
    let mut graph = Graph::<f64>::new(&fc_net(1), ExecutionContext::default())?;
    graph.param(0).expect("weight").set_values(&[1.0, 2.0, 3.0])?;
    graph.adopt_input(0, vec![1.0, 1.0, 1.0])?;
    assert_eq!(graph.forward_prefilled()?, 6.0);
    let back = graph.release_input(0)?.expect("adopted buffer");
    assert_eq!(back, vec![1.0, 1.0, 1.0]);
    assert!(graph.adopt_input(0, vec![1.0]).is_err());
    Ok(())
}
