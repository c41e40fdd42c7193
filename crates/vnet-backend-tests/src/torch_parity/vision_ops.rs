use std::sync::Arc;

use vnet::backend::spec::PortableBackend;
use vnet::ops::functional::{self, Conv2dParams2d, ConvTranspose2dParams2d, Padding2d};

use super::common::*;

#[allow(clippy::too_many_arguments)]
fn run_conv2d_case<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    n: usize,
    h: usize,
    w: usize,
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
    groups: usize,
    bias: bool,
    seed: u64,
) {
    let mut rng = seeded_rng(seed);
    let x_data = random_vec(&mut rng, n * c_in * h * w);
    let weight_dims = [c_out, c_in / groups, kernel, kernel];
    let weight_data = random_vec(&mut rng, weight_dims.iter().product());
    let bias_data = random_vec(&mut rng, c_out);

    let expected = {
        let x_t = torch_tensor(&[n, c_in, h, w], &x_data);
        let w_t = torch_tensor(&weight_dims, &weight_data);
        let b_t = torch_tensor(&[c_out], &bias_data);
        let y_t = x_t.conv2d(
            &w_t,
            if bias { Some(&b_t) } else { None },
            [stride as i64, stride as i64],
            [padding as i64, padding as i64],
            [dilation as i64, dilation as i64],
            groups as i64,
        );
        torch_values(&y_t)
    };

    let x = upload(backend, &[n, c_in, h, w], &x_data);
    let weight = upload(backend, &weight_dims, &weight_data);
    let bias_dev = upload(backend, &[c_out], &bias_data);
    let params = Conv2dParams2d {
        kernel: [kernel, kernel],
        stride: [stride, stride],
        dilation: [dilation, dilation],
        padding: Padding2d::same(padding),
        groups,
    };
    let y = functional::conv2d(
        backend.as_ref(),
        &x,
        &weight,
        bias.then_some(&bias_dev),
        params,
    )
    .unwrap();

    assert_close(&expected, &download(&y));
}

#[allow(clippy::too_many_arguments)]
fn run_conv_transpose2d_case<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    n: usize,
    h: usize,
    w: usize,
    c_in: usize,
    c_out: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    output_padding: usize,
    bias: bool,
    seed: u64,
) {
    let mut rng = seeded_rng(seed);
    let x_data = random_vec(&mut rng, n * c_in * h * w);
    let weight_dims = [c_in, c_out, kernel, kernel];
    let weight_data = random_vec(&mut rng, weight_dims.iter().product());
    let bias_data = random_vec(&mut rng, c_out);

    let expected = {
        let x_t = torch_tensor(&[n, c_in, h, w], &x_data);
        let w_t = torch_tensor(&weight_dims, &weight_data);
        let b_t = torch_tensor(&[c_out], &bias_data);
        let y_t = x_t.conv_transpose2d(
            &w_t,
            if bias { Some(&b_t) } else { None },
            [stride as i64, stride as i64],
            [padding as i64, padding as i64],
            [output_padding as i64, output_padding as i64],
            1,
            [1, 1],
        );
        torch_values(&y_t)
    };

    let x = upload(backend, &[n, c_in, h, w], &x_data);
    let weight = upload(backend, &weight_dims, &weight_data);
    let bias_dev = upload(backend, &[c_out], &bias_data);
    let params = ConvTranspose2dParams2d {
        kernel: [kernel, kernel],
        stride: [stride, stride],
        padding: Padding2d::same(padding),
        output_padding: [output_padding, output_padding],
    };
    let y = functional::conv_transpose2d(
        backend.as_ref(),
        &x,
        &weight,
        bias.then_some(&bias_dev),
        params,
    )
    .unwrap();

    assert_close(&expected, &download(&y));
}

fn run_group_norm_case<B: PortableBackend + 'static>(
    backend: &Arc<B>,
    dims: [usize; 4],
    groups: usize,
    x_data: Vec<f32>,
    seed: u64,
) {
    let mut rng = seeded_rng(seed);
    let channels = dims[1];
    let gamma = random_vec_range(&mut rng, channels, 0.5, 1.5);
    let beta = random_vec(&mut rng, channels);
    let eps = 1e-5;

    let expected = {
        let x_t = torch_tensor(&dims, &x_data);
        let g_t = torch_tensor(&[channels], &gamma);
        let b_t = torch_tensor(&[channels], &beta);
        let y_t = x_t.group_norm(groups as i64, Some(&g_t), Some(&b_t), eps as f64, false);
        torch_values(&y_t)
    };

    let x = upload(backend, &dims, &x_data);
    let g = upload(backend, &[channels], &gamma);
    let b = upload(backend, &[channels], &beta);
    let y = functional::group_norm(backend.as_ref(), &x, &g, &b, groups, eps).unwrap();

    assert_close(&expected, &download(&y));
}

pub fn conv2d_k3_s1_p1_bias_n1_h11_w13_c3_cout8<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    run_conv2d_case(backend, 1, 11, 13, 3, 8, 3, 1, 1, 1, 1, true, 101);
}

pub fn conv2d_k2_s2_p0_bias_n2_h16_w16_c16_cout32<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    run_conv2d_case(backend, 2, 16, 16, 16, 32, 2, 2, 0, 1, 1, true, 102);
}

pub fn conv2d_k1_s1_p0_nobias_n1_h8_w8_c32_cout16<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    run_conv2d_case(backend, 1, 8, 8, 32, 16, 1, 1, 0, 1, 1, false, 103);
}

pub fn conv2d_k3_s1_p2_d2_bias_n1_h13_w13_c4_cout8<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    run_conv2d_case(backend, 1, 13, 13, 4, 8, 3, 1, 2, 2, 1, true, 104);
}

pub fn group_conv2d_g2_k3_s1_p1_bias_n1_h11_w11_c8_cout12<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    run_conv2d_case(backend, 1, 11, 11, 8, 12, 3, 1, 1, 1, 2, true, 105);
}

pub fn conv_transpose2d_k2_s2_bias_n1_h4_w4_c32_cout16<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    run_conv_transpose2d_case(backend, 1, 4, 4, 32, 16, 2, 2, 0, 0, true, 201);
}

pub fn conv_transpose2d_k3_s2_p1_op1_nobias_n2_h5_w7_c4_cout6<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    run_conv_transpose2d_case(backend, 2, 5, 7, 4, 6, 3, 2, 1, 1, false, 202);
}

pub fn group_norm_g8_c16_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let dims = [2, 16, 6, 5];
    let mut rng = seeded_rng(301);
    let x = random_vec_range(&mut rng, dims.iter().product(), -3.0, 5.0);
    run_group_norm_case(backend, dims, 8, x, 302);
}

pub fn group_norm_g8_c256_small_spatial_matches_torch<B: PortableBackend + 'static>(
    backend: &Arc<B>,
) {
    let dims = [1, 256, 1, 1];
    let mut rng = seeded_rng(303);
    let x = random_vec(&mut rng, dims.iter().product());
    run_group_norm_case(backend, dims, 8, x, 304);
}

pub fn group_norm_constant_input_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let dims = [1, 16, 4, 4];
    run_group_norm_case(backend, dims, 8, vec![0.75; dims.iter().product()], 305);
}
