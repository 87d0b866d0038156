use std::error::Error;

use itertools::Itertools;
use ristretto::{
    loom::{
        device::{Cpu, Device, GpuBuilder},
        num::Float,
        shape::Shape,
    },
    nn::{
        check::gradient_check,
        layer::{
            ElementWiseFunctor, InnerProductConfig, Layer, LayerKind, LossConfig,
            RandomNormalConfig, TiedInnerProductConfig,
        },
        net::{Net, NetBuilder},
        neuron::Neuron,
    },
};

const INPUT_DIM: usize = 4;
const LATENT_DIM: usize = 2;
const BATCH: usize = 3;

/// Encoder, reparameterized sample, tied decoder and both loss terms.
fn vae() -> Result<NetBuilder, Box<dyn Error>> {
    let dense = |output_dim, seed| InnerProductConfig::new(output_dim).seed(seed);
    let noise = RandomNormalConfig::new([Shape::new([LATENT_DIM, BATCH])?])
        .seed(17)
        .frozen(true);

    let builder = NetBuilder::new()
        .input("x", [INPUT_DIM, BATCH])
        .layer(
            Layer::new("enc_mean", LayerKind::InnerProduct(dense(LATENT_DIM, 1)))
                .bottom("x")
                .top("z_mean"),
        )
        .layer(
            Layer::new(
                "enc_sd",
                LayerKind::InnerProduct(dense(LATENT_DIM, 2).neuron(Neuron::Exponential)),
            )
            .bottom("x")
            .top("z_sd"),
        )
        .layer(
            Layer::new("split_mean", LayerKind::Split)
                .bottom("z_mean")
                .top("z_mean_kl")
                .top("z_mean_dec"),
        )
        .layer(
            Layer::new("split_sd", LayerKind::Split)
                .bottom("z_sd")
                .top("z_sd_kl")
                .top("z_sd_dec"),
        )
        .layer(Layer::new("noise", LayerKind::RandomNormal(noise)).top("eps"))
        .layer(
            Layer::new("scale", LayerKind::ElementWise(ElementWiseFunctor::Multiply.into()))
                .bottom("z_sd_dec")
                .bottom("eps")
                .top("z_noise"),
        )
        .layer(
            Layer::new("sample", LayerKind::ElementWise(ElementWiseFunctor::Add.into()))
                .bottom("z_mean_dec")
                .bottom("z_noise")
                .top("z"),
        )
        .layer(
            Layer::new("split_z", LayerKind::Split)
                .bottom("z")
                .top("z_mu")
                .top("z_sigma"),
        )
        .layer(
            Layer::new(
                "dec_mean",
                LayerKind::TiedInnerProduct(TiedInnerProductConfig::new("enc_mean")),
            )
            .bottom("z_mu")
            .top("x_mean"),
        )
        .layer(
            Layer::new(
                "dec_sd",
                LayerKind::InnerProduct(dense(INPUT_DIM, 3).neuron(Neuron::Exponential)),
            )
            .bottom("z_sigma")
            .top("x_sd"),
        )
        .layer(
            Layer::new("recon", LayerKind::GaussianReconLoss(LossConfig::default()))
                .bottom("x_mean")
                .bottom("x_sd")
                .bottom("x"),
        )
        .layer(
            Layer::new("kl", LayerKind::EncoderLoss(LossConfig::default()))
                .bottom("z_mean_kl")
                .bottom("z_sd_kl"),
        );
    Ok(builder)
}

fn data<T: Float>() -> Vec<T> {
    let mut rng = fastrand::Rng::with_seed(42);
    (0..INPUT_DIM * BATCH)
        .map(|_| T::from_f64(rng.f64() * 2.0 - 1.0))
        .collect()
}

fn build<D: Device, T: Float>(device: &D) -> Result<Net<D, T>, Box<dyn Error>> {
    let mut net = vae()?.build(device)?;
    net.input_mut("x")?.write(&data::<T>())?;
    Ok(net)
}

#[test]
fn test_vae_gradient_check() -> Result<(), Box<dyn Error>> {
    let cpu = Cpu::new();
    let mut net = build::<_, f64>(&cpu)?;

    let keys = net.params().iter().map(|param| param.name().to_owned()).collect_vec();
    assert_eq!(
        keys,
        vec![
            "enc_mean",
            "enc_mean.bias",
            "enc_sd",
            "enc_sd.bias",
            "dec_mean.bias",
            "dec_sd",
            "dec_sd.bias"
        ]
    );

    let report = gradient_check(&mut net, 1e-6, 1e-5)?;
    assert_eq!(report.params.len(), 7);
    assert!(report.worst() < 1e-5, "{report:?}");
    Ok(())
}

#[test]
fn test_vae_loss_terms() -> Result<(), Box<dyn Error>> {
    let cpu = Cpu::new();
    let mut net = build::<_, f64>(&cpu)?;
    net.forward()?;

    let recon = net.layer("recon").and_then(|layer| layer.loss());
    let kl = net.layer("kl").and_then(|layer| layer.loss());
    let (Some(recon), Some(kl)) = (recon, kl) else {
        return Err("loss layers report no loss".into());
    };
    assert!(kl >= 0.0);
    assert!((net.loss() - (recon + kl)).abs() < 1e-12);

    // the frozen noise makes forwards repeatable
    let loss = net.loss();
    net.forward()?;
    assert_eq!(net.loss(), loss);

    // z = z_mean + z_sd * eps
    let z_mean = net.blob("z_mean")?.read()?;
    let z_sd = net.blob("z_sd")?.read()?;
    let eps = net.blob("eps")?.read()?;
    let z = net.blob("z")?.read()?;
    for k in 0..z.len() {
        assert!((z[k] - (z_mean[k] + z_sd[k] * eps[k])).abs() < 1e-12);
    }
    assert!(z_sd.iter().all(|sd| *sd > 0.0));
    assert!(net.diff("eps")?.is_none());

    net.backward()?;
    net.shutdown();
    assert_eq!(net.loss(), loss);
    assert_eq!(cpu.buffer_count(), 0);
    Ok(())
}

#[test]
fn test_vae_f32_tracks_f64() -> Result<(), Box<dyn Error>> {
    let cpu = Cpu::new();
    let mut single = build::<_, f32>(&cpu)?;
    let mut double = build::<_, f64>(&cpu)?;
    single.forward()?;
    double.forward()?;
    let (single, double) = (single.loss(), double.loss());
    assert!((single - double).abs() < 1e-3 * double.abs().max(1.0));
    Ok(())
}

#[tokio::test]
async fn test_vae_gpu() -> Result<(), Box<dyn Error>> {
    let Ok(builder) = GpuBuilder::request().await else {
        log::warn!("no adapter available, skipping");
        return Ok(());
    };
    let gpu = builder.add_default_ops().build().await?;
    let cpu = Cpu::new();

    let mut on_gpu = build::<_, f32>(&gpu)?;
    let mut on_cpu = build::<_, f32>(&cpu)?;
    on_gpu.forward()?;
    on_gpu.backward()?;
    on_cpu.forward()?;
    on_cpu.backward()?;
    let (expected, got) = (on_cpu.loss(), on_gpu.loss());
    assert!((expected - got).abs() < 1e-3 * expected.abs().max(1.0));

    for param in on_cpu.params() {
        let Some(other) = on_gpu.param(param.name()) else {
            return Err(format!("missing param {}", param.name()).into());
        };
        for (x, y) in param.read_grad()?.into_iter().zip_eq(other.read_grad()?) {
            assert!((x - y).abs() < 1e-3 * x.abs().max(1.0), "{}: {x} vs {y}", param.name());
        }
    }
    Ok(())
}
