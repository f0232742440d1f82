use anyhow::Result;
use serde_json::json;
use stagenet::{
    Arity, ExecutionContext, Graph, InputSpec, NetDescription, NetError, NetResult, ParamSpec,
    Phase, Propagation, Shape, Stage, StageRegistry, StageSpec, StateRule, Tensor,
};

fn graph_error(result: NetResult<Graph<f32>>) -> (String, String) {
    match result {
        Err(NetError::Graph { stage, message }) => (stage, message),
        Err(other) => panic!("expected a graph error, got {other}"),
        Ok(_) => panic!("expected a graph error, got a graph"),
    }
}

fn fc(name: &str, input: &str, output: &str) -> StageSpec {
    StageSpec::new(name, "InnerProduct")
        .with_inputs([input])
        .with_outputs([output])
        .with_config(json!({"num_output": 2, "weight_filler": {"type": "gaussian", "std": 0.3}}))
}

fn base() -> NetDescription {
    NetDescription::new("construction").with_input(InputSpec::new("data", &[2, 3]))
}

#[test]
fn stages_are_filtered_by_phase_and_level() -> Result<()> {
    let desc = NetDescription {
        state: stagenet::NetState {
            level: 2,
            ..Default::default()
        },
        ..base()
            .with_stage(fc("always", "data", "a"))
            .with_stage(fc("train_only", "data", "t").with_include(StateRule::phase(Phase::Train)))
            .with_stage(fc("not_in_test", "data", "n").with_exclude(StateRule::phase(Phase::Test)))
            .with_stage(fc("deep", "data", "d").with_include(StateRule {
                min_level: Some(3),
                ..StateRule::default()
            }))
    };

    let train = Graph::<f32>::new(&desc, ExecutionContext::host(Phase::Train, 0))?;
    let names: Vec<&str> = train.stage_names().collect();
    assert_eq!(names, ["data_input_0_split", "always", "train_only", "not_in_test"]);

    let test = Graph::<f32>::new(&desc, ExecutionContext::host(Phase::Test, 0))?;
    let names: Vec<&str> = test.stage_names().collect();
    assert_eq!(names, ["always"]);
    assert_eq!(test.phase(), Phase::Test);
    Ok(())
}

#[test]
fn include_and_exclude_together_are_rejected() {
    let desc = base().with_stage(
        fc("both", "data", "x")
            .with_include(StateRule::phase(Phase::Train))
            .with_exclude(StateRule::phase(Phase::Test)),
    );
    let (stage, _) = graph_error(Graph::new(&desc, ExecutionContext::default()));
    assert_eq!(stage, "both");
}

#[test]
fn wiring_errors_name_the_stage() {
    let unknown = base().with_stage(fc("fc", "missing", "x"));
    let (stage, message) = graph_error(Graph::new(&unknown, ExecutionContext::default()));
    assert_eq!(stage, "fc");
    assert!(message.contains("unknown blob 'missing'"), "{message}");

    let duplicate = base()
        .with_stage(fc("fc1", "data", "x"))
        .with_stage(fc("fc2", "data", "x"));
    let (stage, message) = graph_error(Graph::new(&duplicate, ExecutionContext::default()));
    assert_eq!(stage, "fc2");
    assert!(message.contains("produced by multiple sources"), "{message}");

    let in_place = base().with_stage(fc("fc", "data", "data"));
    let (_, message) = graph_error(Graph::new(&in_place, ExecutionContext::default()));
    assert!(message.contains("in place"), "{message}");

    let kind = base().with_stage(StageSpec::new("odd", "Teleport").with_inputs(["data"]));
    let (_, message) = graph_error(Graph::new(&kind, ExecutionContext::default()));
    assert!(message.contains("unknown stage kind 'Teleport'"), "{message}");

    let arity = base().with_stage(
        StageSpec::new("loss", "EuclideanLoss")
            .with_inputs(["data"])
            .with_outputs(["l"]),
    );
    let (_, message) = graph_error(Graph::new(&arity, ExecutionContext::default()));
    assert!(message.contains("does not accept 1 inputs"), "{message}");

    let renamed = base()
        .with_stage(fc("same", "data", "x"))
        .with_stage(fc("same", "x", "y"));
    let (_, message) = graph_error(Graph::new(&renamed, ExecutionContext::default()));
    assert!(message.contains("duplicate stage name"), "{message}");
}

#[test]
fn shared_parameters_must_agree_on_multipliers() {
    let desc = base()
        .with_stage(fc("fc1", "data", "x").with_params([ParamSpec::named("w")]))
        .with_stage(fc("fc2", "data", "y").with_params([ParamSpec::named("w").with_lr_mult(2.0)]));
    let (stage, message) = graph_error(Graph::new(&desc, ExecutionContext::default()));
    assert_eq!(stage, "fc2");
    assert!(message.contains("mismatched lr_mult"), "{message}");
}

#[test]
fn sharing_requires_matching_sizes() {
    let desc = base()
        .with_stage(fc("fc1", "data", "x").with_params([ParamSpec::named("w")]))
        .with_stage(
            StageSpec::new("fc2", "InnerProduct")
                .with_inputs(["data"])
                .with_outputs(["y"])
                .with_params([ParamSpec::named("w")])
                .with_config(json!({"num_output": 5})),
        );
    let (_, message) = graph_error(Graph::new(&desc, ExecutionContext::default()));
    assert!(message.contains("cannot share parameter 'w'"), "{message}");
}

#[test]
fn propagate_down_must_match_inputs_and_stops_gradients() -> Result<()> {
    let bad = base().with_stage(fc("fc", "data", "x").with_propagate_down([true, false]));
    let (_, message) = graph_error(Graph::new(&bad, ExecutionContext::default()));
    assert!(message.contains("propagate_down"), "{message}");

    let desc = base()
        .with_stage(fc("fc1", "data", "h"))
        .with_stage(
            fc("fc2", "h", "out")
                .with_propagate_down([false])
                .with_loss_weights(&[1.0]),
        );
    let mut graph = Graph::<f32>::new(&desc, ExecutionContext::default())?;
    assert_eq!(graph.input_needs_backward("fc2"), Some(&[false][..]));
    assert_eq!(graph.stage_needs_backward("fc1"), Some(false));
    assert_eq!(graph.stage_needs_backward("fc2"), Some(true));

    graph.forward_backward(&[&[1.0, 2.0, 3.0, -1.0, 0.5, 0.0][..]])?;
    assert_eq!(graph.param(0).expect("fc1 weight").sum_abs_grads()?, 0.0);
    assert!(graph.param(2).expect("fc2 weight").sum_abs_grads()? > 0.0);
    Ok(())
}

#[test]
fn frozen_parameters_leave_stage_out_of_backward() -> Result<()> {
    let frozen = [ParamSpec::default().with_lr_mult(0.0), ParamSpec::default().with_lr_mult(0.0)];
    let desc = base().with_stage(
        fc("fc", "data", "out")
            .with_params(frozen)
            .with_loss_weights(&[1.0]),
    );
    let graph = Graph::<f32>::new(&desc, ExecutionContext::default())?;
    assert_eq!(graph.stage_needs_backward("fc"), Some(false));
    assert_eq!(graph.params()[0].lr_mult, 0.0);
    Ok(())
}

#[test]
fn stage_fed_only_by_labels_still_learns() -> Result<()> {
    let desc = NetDescription::new("labels")
        .with_input(InputSpec::new("features", &[2, 2]))
        .with_input(InputSpec::new("labels", &[2, 3]))
        .with_stage(fc("fc_label", "labels", "embedded"))
        .with_stage(
            StageSpec::new("loss", "EuclideanLoss")
                .with_inputs(["features", "embedded"])
                .with_outputs(["loss"]),
        );
    let mut graph = Graph::<f32>::new(&desc, ExecutionContext::default())?;
    assert_eq!(graph.stage_needs_backward("fc_label"), Some(true));
    assert_eq!(graph.input_needs_backward("fc_label"), Some(&[false][..]));
    assert_eq!(graph.input_needs_backward("loss"), Some(&[false, true][..]));

    let features = [1.0, -1.0, 0.5, 2.0];
    let labels = [0.0, 1.0, 0.0, 1.0, 0.0, 0.0];
    graph.forward_backward(&[&features[..], &labels[..]])?;
    assert!(graph.param(0).expect("fc_label weight").sum_abs_grads()? > 0.0);
    assert_eq!(graph.inputs()[0].sum_abs_grads()?, 0.0);
    Ok(())
}

#[test]
fn force_backward_respects_label_inputs() -> Result<()> {
    let desc = NetDescription {
        force_backward: true,
        ..NetDescription::new("forced")
            .with_input(InputSpec::new("scores", &[2, 3]))
            .with_input(InputSpec::new("label", &[2]))
            .with_stage(
                StageSpec::new("loss", "SoftmaxWithLoss")
                    .with_inputs(["scores", "label"])
                    .with_outputs(["loss"]),
            )
    };
    let mut graph = Graph::<f64>::new(&desc, ExecutionContext::default())?;
    assert_eq!(graph.input_needs_backward("loss"), Some(&[true, false][..]));
    assert_eq!(graph.loss_weights("loss"), Some(&[1.0][..]));

    let loss = graph.forward_backward(&[&[0.0; 6][..], &[0.0, 2.0][..]])?;
    assert!((loss - 3.0f64.ln()).abs() < 1e-12);
    let grads = graph.inputs()[0].grads()?.to_vec();
    let third = 1.0 / 3.0 / 2.0;
    let expected = [third - 0.5, third, third, third, third, third - 0.5];
    for (g, e) in grads.iter().zip(expected) {
        assert!((g - e).abs() < 1e-12, "{grads:?}");
    }
    Ok(())
}

#[test]
fn legacy_descriptions_are_upgraded_before_building() -> Result<()> {
    let text = r#"{
        "name": "legacy",
        "input": ["data"],
        "input_dim": [2, 3, 1, 1],
        "layers": [
            {
                "name": "ip",
                "type": "INNER_PRODUCT",
                "bottom": ["data"],
                "top": ["ip"],
                "blobs_lr": [1.0, 2.0],
                "inner_product_param": {"num_output": 4}
            },
            {"name": "relu", "type": "RELU", "bottom": ["ip"], "top": ["ip"]}
        ]
    }"#;
    let desc = NetDescription::from_json_str(text)?;
    let mut graph = Graph::<f32>::new(&desc, ExecutionContext::default())?;
    assert_eq!(graph.input_names(), ["data"]);
    assert_eq!(graph.output_names(), ["ip"]);
    assert_eq!(graph.params()[1].lr_mult, 2.0);
    graph.forward(&[&[0.1; 6][..]])?;
    assert_eq!(
        graph.tensor_by_name("ip").expect("ip").shape().dims(),
        &[2, 4]
    );
    Ok(())
}

/// Doubles its input; used to check that custom kinds plug into the registry.
struct Double;

impl Stage<f64> for Double {
    fn kind(&self) -> &'static str {
        "Double"
    }

    fn input_arity(&self) -> Arity {
        Arity::exactly(1)
    }

    fn configure(&mut self, inputs: &[Shape], num_outputs: usize) -> NetResult<Vec<Shape>> {
        Ok(vec![inputs[0].clone(); num_outputs])
    }

    fn forward_host(&mut self, inputs: &[&Tensor<f64>], outputs: &[&Tensor<f64>]) -> NetResult<()> {
        let x = inputs[0].values()?;
        for out in outputs {
            for (y, &v) in out.values_mut()?.iter_mut().zip(x.iter()) {
                *y = 2.0 * v;
            }
        }
        Ok(())
    }

    fn backward_host(
        &mut self,
        outputs: &[&Tensor<f64>],
        propagate: &Propagation<'_>,
        inputs: &[&Tensor<f64>],
    ) -> NetResult<()> {
        if propagate.input(0) {
            let dy = outputs[0].grads()?;
            for (dx, &g) in inputs[0].grads_mut()?.iter_mut().zip(dy.iter()) {
                *dx = 2.0 * g;
            }
        }
        Ok(())
    }
}

fn build_double(_spec: &StageSpec) -> NetResult<Box<dyn Stage<f64>>> {
    Ok(Box::new(Double))
}

#[test]
fn registered_kinds_build_and_run() -> Result<()> {
    let desc = NetDescription {
        force_backward: true,
        ..NetDescription::new("custom")
            .with_input(InputSpec::new("x", &[3]))
            .with_stage(
                StageSpec::new("double", "Double")
                    .with_inputs(["x"])
                    .with_outputs(["y"])
                    .with_loss_weights(&[0.5]),
            )
    };
    assert!(Graph::<f64>::new(&desc, ExecutionContext::default()).is_err());

    let mut registry = StageRegistry::<f64>::builtin();
    registry.register("Double", build_double, false);
    let mut graph = Graph::with_registry(&desc, ExecutionContext::default(), &registry)?;
    let loss = graph.forward_backward(&[&[1.0, 2.0, 3.0][..]])?;
    assert_eq!(loss, 6.0);
    assert_eq!(&*graph.inputs()[0].grads()?, &[1.0, 1.0, 1.0]);
    assert!(graph.stage_as::<Double>("double").is_some());
    Ok(())
}

#[test]
fn forward_checks_input_count() -> Result<()> {
    let desc = base().with_stage(fc("fc", "data", "x"));
    let mut graph = Graph::<f32>::new(&desc, ExecutionContext::default())?;
    let x = [0.0f32; 6];
    assert!(matches!(
        graph.forward(&[&x[..], &x[..]]),
        Err(NetError::Graph { .. })
    ));
    assert!(matches!(graph.forward(&[&x[..2]]), Err(NetError::Shape(_))));
    graph.forward(&[&x[..]])?;
    Ok(())
}
