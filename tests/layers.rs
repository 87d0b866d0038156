use std::error::Error;

use ristretto::{
    loom::device::Cpu,
    nn::{
        check::gradient_check,
        layer::{
            ElementWiseFunctor, InnerProductConfig, Layer, LayerKind, LossConfig,
            TiedInnerProductConfig,
        },
        net::NetBuilder,
        neuron::Neuron,
        param::Initializer,
    },
};

/// Feeds `mean` and `sd` into a KL loss so any upstream layer gets a scalar objective.
fn with_loss(builder: NetBuilder, mean: &str, sd: &str) -> NetBuilder {
    builder.layer(
        Layer::new("kl", LayerKind::EncoderLoss(LossConfig { weight: 0.5 }))
            .bottom(mean)
            .bottom(sd),
    )
}

#[test]
fn test_element_wise_gradients() -> Result<(), Box<dyn Error>> {
    let cpu = Cpu::new();
    for functor in [
        ElementWiseFunctor::Add,
        ElementWiseFunctor::Subtract,
        ElementWiseFunctor::Multiply,
        ElementWiseFunctor::Divide,
    ] {
        let sigmoid = |output_dim, seed| {
            LayerKind::InnerProduct(
                InnerProductConfig::new(output_dim)
                    .neuron(Neuron::Sigmoid)
                    .seed(seed),
            )
        };
        let builder = NetBuilder::new()
            .input("x", [3, 2])
            .layer(Layer::new("a", sigmoid(3, 1)).bottom("x").top("a"))
            .layer(Layer::new("b", sigmoid(3, 2)).bottom("x").top("b"))
            .layer(
                Layer::new("op", LayerKind::ElementWise(functor.into()))
                    .bottom("a")
                    .bottom("b")
                    .top("c"),
            )
            .layer(
                Layer::new("sd", sigmoid(3, 3))
                    .bottom("c")
                    .top("sd"),
            )
            .layer(Layer::new("mean", sigmoid(3, 4)).bottom("x").top("mean"));
        let mut net = with_loss(builder, "mean", "sd").build::<_, f64>(&cpu)?;
        net.input_mut("x")?.write(&[0.3, -0.2, 0.9, -0.7, 0.1, 0.4])?;

        let report = gradient_check(&mut net, 1e-6, 1e-6)?;
        assert!(report.worst() < 1e-6, "{functor}: {report:?}");
    }
    Ok(())
}

#[test]
fn test_tied_gradients() -> Result<(), Box<dyn Error>> {
    let cpu = Cpu::new();
    let builder = NetBuilder::new()
        .input("x", [3, 4])
        .layer(
            Layer::new(
                "enc",
                LayerKind::InnerProduct(
                    InnerProductConfig::new(2)
                        .weight_init(Initializer::Gaussian { std: 0.5 })
                        .bias_init(Initializer::Constant(0.1))
                        .seed(7),
                ),
            )
            .bottom("x")
            .top("h"),
        )
        .layer(
            Layer::new(
                "dec",
                LayerKind::TiedInnerProduct(
                    TiedInnerProductConfig::new("enc").neuron(Neuron::Exponential),
                ),
            )
            .bottom("h")
            .top("y"),
        )
        .layer(
            Layer::new(
                "mean",
                LayerKind::InnerProduct(InnerProductConfig::new(3).bias(false).seed(8)),
            )
            .bottom("x")
            .top("mean"),
        );
    let mut net = with_loss(builder, "mean", "y").build::<_, f64>(&cpu)?;
    net.input_mut("x")?
        .write(&[0.5, 0.1, -0.3, 0.2, 0.8, -0.6, -0.4, 0.0, 0.7, 0.3, -0.1, 0.9])?;

    let report = gradient_check(&mut net, 1e-6, 1e-6)?;
    let names: Vec<_> = report.params.iter().map(|param| param.name.as_str()).collect();
    assert_eq!(names, vec!["enc", "enc.bias", "dec.bias", "mean"]);
    Ok(())
}

#[cfg(feature = "serde")]
#[test]
fn test_builder_serde() -> Result<(), Box<dyn Error>> {
    let builder = NetBuilder::new()
        .input("x", [3, 2])
        .layer(
            Layer::new(
                "fc",
                LayerKind::InnerProduct(InnerProductConfig::new(4).neuron(Neuron::relu())),
            )
            .bottom("x")
            .top("h"),
        )
        .layer(Layer::new("split", LayerKind::Split).bottom("h").top("m").top("s"));
    let builder = with_loss(builder, "m", "s");

    let json = serde_json::to_string(&builder)?;
    let decoded: NetBuilder = serde_json::from_str(&json)?;
    assert_eq!(decoded, builder);

    let cpu = Cpu::new();
    let net = decoded.build::<_, f32>(&cpu)?;
    assert_eq!(net.layer_names(), vec!["fc", "split", "kl"]);
    Ok(())
}

#[cfg(feature = "serde")]
#[test]
fn test_zero_axis_rejected() -> Result<(), Box<dyn Error>> {
    use ristretto::{loom::shape::Shape, nn::layer::RandomNormalConfig};

    let noise = RandomNormalConfig::new([Shape::new([2, 7])?]).seed(1);
    let builder = NetBuilder::new()
        .layer(Layer::new("noise", LayerKind::RandomNormal(noise)).top("eps"))
        .layer(
            Layer::new("fc", LayerKind::InnerProduct(InnerProductConfig::new(3)))
                .bottom("eps")
                .top("h"),
        )
        .layer(Layer::new("split", LayerKind::Split).bottom("h").top("m").top("s"));
    let builder = with_loss(builder, "m", "s");

    let json = serde_json::to_string(&builder)?;
    assert!(json.contains("[2,7]"));
    let decoded: NetBuilder = serde_json::from_str(&json)?;
    assert_eq!(decoded, builder);

    // a zero-sized axis never reaches the layers
    let json = json.replace("[2,7]", "[2,0]");
    assert!(serde_json::from_str::<NetBuilder>(&json).is_err());
    Ok(())
}
