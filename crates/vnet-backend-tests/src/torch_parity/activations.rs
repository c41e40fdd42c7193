use std::sync::Arc;

use tch::Kind;
use vnet::backend::spec::PortableBackend;
use vnet::ops::functional;

use super::common::*;

pub fn elu_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let shape = [2, 4, 5, 3];
    let mut rng = seeded_rng(401);
    let data = random_vec_range(&mut rng, shape.iter().product(), -6.0, 6.0);

    let expected = torch_values(&torch_tensor(&shape, &data).elu());

    let x = upload(backend, &shape, &data);
    let y = functional::elu(backend.as_ref(), &x, 1.0).unwrap();
    assert_close(&expected, &download(&y));
}

pub fn prelu_per_channel_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let shape = [2, 6, 4, 4];
    let mut rng = seeded_rng(402);
    let data = random_vec(&mut rng, shape.iter().product());
    let slopes = random_vec_range(&mut rng, shape[1], 0.0, 0.5);

    let expected = {
        let x_t = torch_tensor(&shape, &data);
        let w_t = torch_tensor(&[shape[1]], &slopes);
        torch_values(&x_t.prelu(&w_t))
    };

    let x = upload(backend, &shape, &data);
    let w = upload(backend, &[shape[1]], &slopes);
    let y = functional::prelu(backend.as_ref(), &x, &w).unwrap();
    assert_close(&expected, &download(&y));
}

pub fn sigmoid_extreme_inputs_match_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let shape = [1, 1, 2, 4];
    let data = vec![-100.0, -20.0, -1.5, 0.0, 0.25, 3.0, 20.0, 100.0];

    let expected = torch_values(&torch_tensor(&shape, &data).sigmoid());

    let x = upload(backend, &shape, &data);
    let y = functional::sigmoid(backend.as_ref(), &x).unwrap();
    let actual = download(&y);
    assert!(actual.iter().all(|v| v.is_finite()));
    assert_close(&expected, &actual);
}

pub fn softmax_channels_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let shape = [2, 5, 3, 7];
    let mut rng = seeded_rng(403);
    let data = random_vec_range(&mut rng, shape.iter().product(), -4.0, 4.0);

    let expected = torch_values(&torch_tensor(&shape, &data).softmax(1, Kind::Float));

    let x = upload(backend, &shape, &data);
    let y = functional::softmax(backend.as_ref(), &x, 1).unwrap();
    assert_close(&expected, &download(&y));
}

pub fn softmax_extreme_logits_matches_torch<B: PortableBackend + 'static>(backend: &Arc<B>) {
    let shape = [1, 3, 1, 2];
    let data = vec![80.0, -80.0, 85.0, -90.0, 79.0, -85.0];

    let expected = torch_values(&torch_tensor(&shape, &data).softmax(1, Kind::Float));

    let x = upload(backend, &shape, &data);
    let y = functional::softmax(backend.as_ref(), &x, 1).unwrap();
    let actual = download(&y);
    assert!(actual.iter().all(|v| v.is_finite()));
    assert_close(&expected, &actual);
}
