//! Recomputes the whole network on the host in f64, layer by layer, and compares every stage of
//! `forward_trace` against it.

use std::collections::HashMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vnet::model::{VNet2d, VNet2dConfig};
use vnet::module::for_each_parameter;
use vnet::tensor::{DeviceTensor, Shape, Tensor};
use vnet_backend_ref_cpu::CpuPortableBackend;

const ATOL: f64 = 1e-3;
const RTOL: f64 = 1e-3;

#[derive(Clone, Debug)]
struct Nchw {
    dims: [usize; 4],
    data: Vec<f64>,
}

impl Nchw {
    fn zeros(dims: [usize; 4]) -> Self {
        Nchw {
            dims,
            data: vec![0.0; dims.iter().product()],
        }
    }

    fn from_tensor(tensor: &Tensor) -> Self {
        let d = tensor.shape().dims();
        Nchw {
            dims: [d[0], d[1], d[2], d[3]],
            data: tensor.data().iter().map(|&v| v as f64).collect(),
        }
    }

    fn at(&self, n: usize, c: usize, y: usize, x: usize) -> usize {
        let [_, cs, h, w] = self.dims;
        ((n * cs + c) * h + y) * w + x
    }

    fn map(&self, f: impl Fn(usize, f64) -> f64) -> Self {
        let plane = self.dims[2] * self.dims[3];
        let channels = self.dims[1];
        Nchw {
            dims: self.dims,
            data: self
                .data
                .iter()
                .enumerate()
                .map(|(idx, &v)| f((idx / plane) % channels, v))
                .collect(),
        }
    }

    fn add(&self, rhs: &Nchw) -> Self {
        assert_eq!(self.dims, rhs.dims);
        Nchw {
            dims: self.dims,
            data: self.data.iter().zip(&rhs.data).map(|(a, b)| a + b).collect(),
        }
    }
}

/// Host copy of the named parameters plus the activation choice.
struct Reference {
    params: HashMap<String, Tensor>,
    elu: bool,
}

impl Reference {
    fn values(&self, name: &str) -> (&[usize], Vec<f64>) {
        let tensor = self
            .params
            .get(name)
            .unwrap_or_else(|| panic!("missing {name}"));
        (
            tensor.shape().dims(),
            tensor.data().iter().map(|&v| v as f64).collect(),
        )
    }

    fn conv(&self, prefix: &str, x: &Nchw, stride: usize, pad: usize) -> Nchw {
        let (wd, w) = self.values(&format!("{prefix}.weight"));
        let (c_out, c_in, kh, kw) = (wd[0], wd[1], wd[2], wd[3]);
        let (_, b) = self.values(&format!("{prefix}.bias"));
        let [n, xc, h, wi] = x.dims;
        assert_eq!(xc, c_in, "{prefix}");
        let oh = (h + 2 * pad - kh) / stride + 1;
        let ow = (wi + 2 * pad - kw) / stride + 1;
        let mut out = Nchw::zeros([n, c_out, oh, ow]);
        for bn in 0..n {
            for oc in 0..c_out {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = b[oc];
                        for ic in 0..c_in {
                            for ky in 0..kh {
                                for kx in 0..kw {
                                    let iy = (oy * stride + ky) as isize - pad as isize;
                                    let ix = (ox * stride + kx) as isize - pad as isize;
                                    if iy < 0 || ix < 0 || iy >= h as isize || ix >= wi as isize {
                                        continue;
                                    }
                                    let xv = x.data[x.at(bn, ic, iy as usize, ix as usize)];
                                    acc += xv * w[((oc * c_in + ic) * kh + ky) * kw + kx];
                                }
                            }
                        }
                        let idx = out.at(bn, oc, oy, ox);
                        out.data[idx] = acc;
                    }
                }
            }
        }
        out
    }

    /// Stride-2 2x2 transposed conv: every input pixel scatters into its own 2x2 block.
    fn up_conv(&self, prefix: &str, x: &Nchw) -> Nchw {
        let (wd, w) = self.values(&format!("{prefix}.weight"));
        let (c_in, c_out, kh, kw) = (wd[0], wd[1], wd[2], wd[3]);
        let (_, b) = self.values(&format!("{prefix}.bias"));
        let [n, _, h, wi] = x.dims;
        let mut out = Nchw::zeros([n, c_out, h * 2, wi * 2]);
        for bn in 0..n {
            for oc in 0..c_out {
                for oy in 0..h * 2 {
                    for ox in 0..wi * 2 {
                        let (iy, ky) = (oy / 2, oy % 2);
                        let (ix, kx) = (ox / 2, ox % 2);
                        let mut acc = b[oc];
                        for ic in 0..c_in {
                            acc += x.data[x.at(bn, ic, iy, ix)]
                                * w[((ic * c_out + oc) * kh + ky) * kw + kx];
                        }
                        let idx = out.at(bn, oc, oy, ox);
                        out.data[idx] = acc;
                    }
                }
            }
        }
        out
    }

    fn group_norm(&self, prefix: &str, x: &Nchw) -> Nchw {
        let (_, gamma) = self.values(&format!("{prefix}.weight"));
        let (_, beta) = self.values(&format!("{prefix}.bias"));
        let [n, c, h, w] = x.dims;
        let per_group = c / 8;
        let block = per_group * h * w;
        let mut out = x.clone();
        for bn in 0..n {
            for g in 0..8 {
                let start = (bn * c + g * per_group) * h * w;
                let slice = &x.data[start..start + block];
                let mean = slice.iter().sum::<f64>() / block as f64;
                let var = slice.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / block as f64;
                let inv = 1.0 / (var + 1e-5).sqrt();
                for (offset, v) in slice.iter().enumerate() {
                    let ch = g * per_group + offset / (h * w);
                    out.data[start + offset] = (v - mean) * inv * gamma[ch] + beta[ch];
                }
            }
        }
        out
    }

    fn act(&self, prefix: &str, x: &Nchw) -> Nchw {
        if self.elu {
            x.map(|_, v| if v > 0.0 { v } else { v.exp_m1() })
        } else {
            let (_, slopes) = self.values(&format!("{prefix}.weight"));
            x.map(|c, v| if v >= 0.0 { v } else { slopes[c] * v })
        }
    }

    fn lu_stack(&self, prefix: &str, depth: usize, x: &Nchw) -> Nchw {
        let mut out = x.clone();
        for idx in 0..depth {
            let p = format!("{prefix}.ops.{idx}");
            let conv = self.conv(&format!("{p}.conv1"), &out, 1, 1);
            out = self.act(&format!("{p}.relu1"), &self.group_norm(&format!("{p}.bn1"), &conv));
        }
        out
    }

    fn input_transition(&self, x: &Nchw) -> Nchw {
        let out = self.group_norm("in_tr.bn1", &self.conv("in_tr.conv1", x, 1, 1));
        let x16 = self.conv("in_tr.conv2", x, 1, 0);
        self.act("in_tr.relu1", &out.add(&x16))
    }

    fn down_transition(&self, name: &str, depth: usize, x: &Nchw) -> Nchw {
        let down = self.conv(&format!("{name}.down_conv"), x, 2, 0);
        let down = self.act(
            &format!("{name}.relu1"),
            &self.group_norm(&format!("{name}.bn1"), &down),
        );
        let out = self.lu_stack(name, depth, &down);
        self.act(&format!("{name}.relu2"), &out.add(&down))
    }

    fn up_transition(&self, name: &str, depth: usize, x: &Nchw, skip: &Nchw) -> Nchw {
        let bn = format!("{name}.bn");
        let relu = format!("{name}.relu");
        let out = self.up_conv(&format!("{name}.up_conv"), x);
        let out = self.act(&relu, &self.group_norm(&bn, &out));

        let [n, c_out, h, w] = out.dims;
        let c_skip = skip.dims[1];
        let mut xcat = Nchw::zeros([n, c_out + c_skip, h, w]);
        let plane = h * w;
        for bn_idx in 0..n {
            let dst = &mut xcat.data[bn_idx * (c_out + c_skip) * plane..];
            dst[..c_out * plane]
                .copy_from_slice(&out.data[bn_idx * c_out * plane..][..c_out * plane]);
            dst[c_out * plane..(c_out + c_skip) * plane]
                .copy_from_slice(&skip.data[bn_idx * c_skip * plane..][..c_skip * plane]);
        }

        let xcat = self.conv(&format!("{name}.conv"), &xcat, 1, 0);
        let xcat = self.act(&relu, &self.group_norm(&bn, &xcat));
        let out = self.lu_stack(name, depth, &xcat);
        self.act(&relu, &out.add(&xcat))
    }

    fn probabilities(logits: &Nchw) -> Nchw {
        let [n, c, h, w] = logits.dims;
        if c == 1 {
            return logits.map(|_, v| 1.0 / (1.0 + (-v).exp()));
        }
        let mut out = logits.clone();
        for bn in 0..n {
            for y in 0..h {
                for x in 0..w {
                    let idx: Vec<usize> = (0..c).map(|k| logits.at(bn, k, y, x)).collect();
                    let max = idx
                        .iter()
                        .map(|&i| logits.data[i])
                        .fold(f64::NEG_INFINITY, f64::max);
                    let denom: f64 = idx.iter().map(|&i| (logits.data[i] - max).exp()).sum();
                    for &i in &idx {
                        out.data[i] = (logits.data[i] - max).exp() / denom;
                    }
                }
            }
        }
        out
    }

    fn forward(&self, x: &Nchw) -> Vec<(String, Nchw)> {
        let mut trace = Vec::new();
        let out16 = self.input_transition(x);
        trace.push(("in_tr".to_string(), out16.clone()));
        let out32 = self.down_transition("down_tr32", 2, &out16);
        trace.push(("down_tr32".to_string(), out32.clone()));
        let out64 = self.down_transition("down_tr64", 3, &out32);
        trace.push(("down_tr64".to_string(), out64.clone()));
        let out128 = self.down_transition("down_tr128", 3, &out64);
        trace.push(("down_tr128".to_string(), out128.clone()));
        let out256 = self.down_transition("down_tr256", 3, &out128);
        trace.push(("down_tr256".to_string(), out256.clone()));

        let out = self.up_transition("up_tr256", 3, &out256, &out128);
        trace.push(("up_tr256".to_string(), out.clone()));
        let out = self.up_transition("up_tr128", 3, &out, &out64);
        trace.push(("up_tr128".to_string(), out.clone()));
        let out = self.up_transition("up_tr64", 2, &out, &out32);
        trace.push(("up_tr64".to_string(), out.clone()));
        let out = self.up_transition("up_tr32", 1, &out, &out16);
        trace.push(("up_tr32".to_string(), out.clone()));

        let logits = self.conv("out_tr.conv", &out, 1, 0);
        let probabilities = Self::probabilities(&logits);
        trace.push(("out_tr.logits".to_string(), logits));
        trace.push(("out_tr.probabilities".to_string(), probabilities));
        trace
    }
}

/// Random parameters with non-trivial norm affines and PReLU slopes.
fn perturbed_parameters(config: &VNet2dConfig, seed: u64) -> HashMap<String, Tensor> {
    let backend = Arc::new(CpuPortableBackend::new());
    let mut rng = StdRng::seed_from_u64(seed);
    let model = VNet2d::random(config.clone(), backend, &mut rng).unwrap();
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
                let data = (0..host.len()).map(|_| rng.gen_range(lo..hi)).collect();
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

fn check_against_reference(config: VNet2dConfig, seed: u64) {
    let backend = Arc::new(CpuPortableBackend::new());
    let params = perturbed_parameters(&config, seed);
    let model =
        VNet2d::from_named_tensors(config.clone(), Arc::clone(&backend), params.clone()).unwrap();
    let reference = Reference {
        params,
        elu: config.elu,
    };

    let dims = [2, config.image_channels, 16, 16];
    let mut rng = StdRng::seed_from_u64(seed + 1);
    let input = Tensor::randn(Shape::new(dims.to_vec()), 1.0, &mut rng);
    let expected = reference.forward(&Nchw::from_tensor(&input));
    let x = DeviceTensor::from_host(Arc::clone(&backend), input).unwrap();
    let actual = model.forward_trace(&x).unwrap();

    assert_eq!(actual.len(), expected.len());
    for ((name, tensor), (expected_name, reference)) in actual.iter().zip(&expected) {
        assert_eq!(name, expected_name);
        let host = Nchw::from_tensor(&tensor.to_host().unwrap());
        assert_eq!(host.dims, reference.dims, "{name}");
        for (idx, (&a, &e)) in host.data.iter().zip(&reference.data).enumerate() {
            assert!(
                (a - e).abs() <= ATOL + RTOL * e.abs(),
                "{name}[{idx}]: network {a}, reference {e}"
            );
        }
    }
}

#[test]
fn elu_network_matches_host_reference() {
    check_against_reference(VNet2dConfig::new(2, 3, true), 31);
}

#[test]
fn prelu_network_with_sigmoid_head_matches_host_reference() {
    check_against_reference(VNet2dConfig::new(1, 1, false), 32);
}
