use std::collections::HashMap;
use std::sync::Arc;

use tch::{Kind, Tensor as TchTensor};
use vnet::backend::spec::PortableBackend;
use vnet::module::for_each_parameter;
use vnet::tensor::{Shape, Tensor};
use vnet::{VNet2d, VNet2dConfig};

use super::common::*;

/// The same network expressed with libtorch ops, reading weights by state-dict name.
struct TorchVNet {
    params: HashMap<String, TchTensor>,
    elu: bool,
}

impl TorchVNet {
    fn p(&self, name: &str) -> &TchTensor {
        self.params
            .get(name)
            .unwrap_or_else(|| panic!("missing {name}"))
    }

    fn conv(&self, prefix: &str, x: &TchTensor, stride: i64, padding: i64) -> TchTensor {
        x.conv2d(
            self.p(&format!("{prefix}.weight")),
            Some(self.p(&format!("{prefix}.bias"))),
            [stride, stride],
            [padding, padding],
            [1, 1],
            1,
        )
    }

    fn up_conv(&self, prefix: &str, x: &TchTensor) -> TchTensor {
        x.conv_transpose2d(
            self.p(&format!("{prefix}.weight")),
            Some(self.p(&format!("{prefix}.bias"))),
            [2, 2],
            [0, 0],
            [0, 0],
            1,
            [1, 1],
        )
    }

    fn norm(&self, prefix: &str, x: &TchTensor) -> TchTensor {
        x.group_norm(
            8,
            Some(self.p(&format!("{prefix}.weight"))),
            Some(self.p(&format!("{prefix}.bias"))),
            1e-5,
            false,
        )
    }

    fn act(&self, prefix: &str, x: &TchTensor) -> TchTensor {
        if self.elu {
            x.elu()
        } else {
            x.prelu(self.p(&format!("{prefix}.weight")))
        }
    }

    fn ops(&self, prefix: &str, depth: usize, x: &TchTensor) -> TchTensor {
        let mut out = x.shallow_clone();
        for idx in 0..depth {
            let p = format!("{prefix}.ops.{idx}");
            let conv = self.conv(&format!("{p}.conv1"), &out, 1, 1);
            out = self.act(&format!("{p}.relu1"), &self.norm(&format!("{p}.bn1"), &conv));
        }
        out
    }

    fn down(&self, name: &str, depth: usize, x: &TchTensor) -> TchTensor {
        let down = self.conv(&format!("{name}.down_conv"), x, 2, 0);
        let down = self.act(&format!("{name}.relu1"), &self.norm(&format!("{name}.bn1"), &down));
        let out = self.ops(name, depth, &down);
        self.act(&format!("{name}.relu2"), &(&out + &down))
    }

    fn up(&self, name: &str, depth: usize, x: &TchTensor, skip: &TchTensor) -> TchTensor {
        let (bn, relu) = (format!("{name}.bn"), format!("{name}.relu"));
        let out = self.up_conv(&format!("{name}.up_conv"), x);
        let out = self.act(&relu, &self.norm(&bn, &out));
        let xcat = TchTensor::cat(&[&out, skip], 1);
        let xcat = self.conv(&format!("{name}.conv"), &xcat, 1, 0);
        let xcat = self.act(&relu, &self.norm(&bn, &xcat));
        let out = self.ops(name, depth, &xcat);
        self.act(&relu, &(&out + &xcat))
    }

    fn forward(&self, x: &TchTensor) -> (TchTensor, TchTensor) {
        let out = self.norm("in_tr.bn1", &self.conv("in_tr.conv1", x, 1, 1));
        let out16 = self.act("in_tr.relu1", &(&out + &self.conv("in_tr.conv2", x, 1, 0)));
        let out32 = self.down("down_tr32", 2, &out16);
        let out64 = self.down("down_tr64", 3, &out32);
        let out128 = self.down("down_tr128", 3, &out64);
        let out256 = self.down("down_tr256", 3, &out128);
        let out = self.up("up_tr256", 3, &out256, &out128);
        let out = self.up("up_tr128", 3, &out, &out64);
        let out = self.up("up_tr64", 2, &out, &out32);
        let out = self.up("up_tr32", 1, &out, &out16);
        let logits = self.conv("out_tr.conv", &out, 1, 0);
        let probabilities = if logits.size()[1] == 1 {
            logits.sigmoid()
        } else {
            logits.softmax(1, Kind::Float)
        };
        (logits, probabilities)
    }
}

/// Random weights with non-identity norm affines and spread-out PReLU slopes.
fn named_parameters<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    config: &VNet2dConfig,
    seed: u64,
) -> HashMap<String, Tensor> {
    let mut rng = seeded_rng(seed);
    let model = VNet2d::random(config.clone(), Arc::clone(backend), &mut rng).unwrap();
    let mut params = HashMap::new();
    for_each_parameter(&model, |name, _, tensor| {
        let host = tensor.to_host()?;
        let range = if name.contains(".bn") && name.ends_with(".weight") {
            Some((0.5, 1.5))
        } else if name.contains(".bn") {
            Some((-0.5, 0.5))
        } else if name.contains(".relu") {
            Some((0.05, 0.45))
        } else {
            None
        };
        let host = match range {
            Some((lo, hi)) => {
                let data = random_vec_range(&mut rng, host.len(), lo, hi);
                Tensor::from_vec(host.shape().clone(), data)?
            }
            None => host,
        };
        params.insert(name.to_string(), host);
        Ok(())
    })
    .unwrap();
    params
}

fn run_vnet2d_case<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    config: VNet2dConfig,
    dims: [usize; 4],
    seed: u64,
) {
    let params = named_parameters(backend, &config, seed);
    let mut rng = seeded_rng(seed + 1);
    let x_data = random_vec(&mut rng, dims.iter().product());

    let (expected_logits, expected_probs) = {
        let torch = TorchVNet {
            params: params
                .iter()
                .map(|(name, t)| (name.clone(), torch_tensor(t.shape().dims(), t.data())))
                .collect(),
            elu: config.elu,
        };
        let (logits, probs) = torch.forward(&torch_tensor(&dims, &x_data));
        (torch_values(&logits), torch_values(&probs))
    };

    let model = VNet2d::from_named_tensors(config, Arc::clone(backend), params).unwrap();
    let x = upload(backend, &dims, &x_data);
    let output = model.forward(&x).unwrap();
    assert_eq!(
        output.logits.shape(),
        &Shape::new([dims[0], model.config.num_classes, dims[2], dims[3]])
    );
    assert_close_within(&expected_logits, &download(&output.logits), 2e-3, 1e-3);
    assert_close_within(&expected_probs, &download(&output.probabilities), 2e-3, 1e-3);
}

pub fn vnet2d_elu_softmax_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    run_vnet2d_case(backend, VNet2dConfig::new(2, 3, true), [2, 2, 16, 16], 601);
}

pub fn vnet2d_prelu_sigmoid_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    run_vnet2d_case(backend, VNet2dConfig::new(1, 1, false), [1, 1, 32, 16], 602);
}
