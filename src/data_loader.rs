use super::*;
use decoder::PositionDecoder;
use hcpe::{Hcpe, SQUARE_NB, BOARD_SIZE};
use rand::Rng;
use rayon::prelude::*;
use tch::{Device, Tensor};

const BOARD : i64 = BOARD_SIZE as i64;

/// tensors of one mini batch.
pub struct MiniBatch {
    /// [B, F1, 9, 9]
    pub features1 : Tensor,
    /// [B, F2, 9, 9]
    pub features2 : Tensor,
    /// [B] move labels.
    pub moves : Tensor,
    /// [B, 1] game results.
    pub result : Tensor,
    /// [B] result - value + 0.5
    pub z : Tensor,
    /// [B, 1] value labels.
    pub value : Tensor,
}

impl MiniBatch {
    pub fn len(&self) -> i64 {
        self.moves.size()[0]
    }
}

/// head indices of every full mini batch in `len` positions.
/// trailing positions less than `batchsize` are dropped.
pub fn batch_starts(len : usize, batchsize : usize) -> impl Iterator<Item = usize> {
    (0..(len + 1).saturating_sub(batchsize)).step_by(batchsize.max(1))
}

fn in_batch(reason : String) -> String {
    format!("in mini batch: {reason}")
}

/// decode `hcpevec` and put the tensors on `device`.
///
/// a malformed record is reported with its index in `hcpevec`.
pub fn mini_batch(hcpevec : &[Hcpe], decoder : &dyn PositionDecoder, device : Device)
        -> Result<MiniBatch> {
    let n = hcpevec.len();
    let f1size = decoder.features1_num() * SQUARE_NB;
    let f2size = decoder.features2_num() * SQUARE_NB;
    let mut features1 = vec![0f32; n * f1size];
    let mut features2 = vec![0f32; n * f2size];

    features1.par_chunks_mut(f1size.max(1))
        .zip(features2.par_chunks_mut(f2size.max(1)))
        .zip(hcpevec.par_iter())
        .enumerate()
        .try_for_each(|(i, ((f1, f2), h))| {
            decoder.decode(h, f1, f2).map_err(|e| TrainError::malformed(i, in_batch(e)))
        })?;

    let mut moves = Vec::with_capacity(n);
    let mut result = Vec::with_capacity(n);
    let mut value = Vec::with_capacity(n);
    for (i, h) in hcpevec.iter().enumerate() {
        moves.push(h.move_label().map_err(|e| TrainError::malformed(i, in_batch(e)))?);
        result.push(h.result_label().map_err(|e| TrainError::malformed(i, in_batch(e)))?);
        value.push(h.value_label());
    }
    let z = result.iter().zip(value.iter())
        .map(|(r, v)| r - v + 0.5).collect::<Vec<f32>>();

    let n = n as i64;
    Ok(MiniBatch {
        features1: Tensor::from_slice(&features1)
            .view((n, decoder.features1_num() as i64, BOARD, BOARD)).to_device(device),
        features2: Tensor::from_slice(&features2)
            .view((n, decoder.features2_num() as i64, BOARD, BOARD)).to_device(device),
        moves: Tensor::from_slice(&moves).to_device(device),
        result: Tensor::from_slice(&result).view((n, 1)).to_device(device),
        z: Tensor::from_slice(&z).to_device(device),
        value: Tensor::from_slice(&value).view((n, 1)).to_device(device),
    })
}

/// pick `n` positions at random, allowing duplicates.
pub fn sample<R : Rng>(hcpevec : &[Hcpe], n : usize, rng : &mut R) -> Vec<Hcpe> {
    (0..n).map(|_| hcpevec[rng.gen_range(0..hcpevec.len())]).collect()
}

#[cfg(test)]
pub fn synthetic(n : usize) -> Vec<Hcpe> {
    use hcpe::{record, Color, GameResult};
    (0..n).map(|i| {
        let turn = if i % 2 == 0 {Color::Black} else {Color::White};
        let result = match i % 3 {
            0 => GameResult::Draw,
            1 => GameResult::BlackWin,
            _ => GameResult::WhiteWin,
        };
        let mut rec = record(turn, 40, 39 - (i % 4), false, result,
                             ((i % 100) as i16 - 50) * 17);
        rec.hcp[2] = i as u8;
        rec
    }).collect()
}

#[test]
fn test_batch_starts() {
    assert_eq!(batch_starts(2048, 1024).collect::<Vec<_>>(), vec![0, 1024]);
    assert_eq!(batch_starts(2047, 1024).collect::<Vec<_>>(), vec![0]);
    assert_eq!(batch_starts(2049, 1024).collect::<Vec<_>>(), vec![0, 1024]);
    assert_eq!(batch_starts(100, 1024).count(), 0);
    assert_eq!(batch_starts(10, 3).collect::<Vec<_>>(), vec![0, 3, 6]);
}

#[test]
fn test_mini_batch() {
    let data = synthetic(16);
    let dec = decoder::HcpBitPlanes;
    let b = mini_batch(&data[4..12], &dec, Device::Cpu).unwrap();
    assert_eq!(b.len(), 8);
    assert_eq!(b.features1.size(), vec![8, 4, 9, 9]);
    assert_eq!(b.features2.size(), vec![8, 1, 9, 9]);
    assert_eq!(b.moves.size(), vec![8]);
    assert_eq!(b.result.size(), vec![8, 1]);
    assert_eq!(b.value.size(), vec![8, 1]);
    assert_eq!(b.z.size(), vec![8]);

    // z is derived from the labels of this batch.
    for (i, h) in data[4..12].iter().enumerate() {
        let expect = h.result_label().unwrap() - h.value_label() + 0.5;
        let z = b.z.double_value(&[i as i64]) as f32;
        assert!((z - expect).abs() < 1e-6);
        assert!((-0.5..=1.5).contains(&z));
    }

    // deterministic.
    let again = mini_batch(&data[4..12], &dec, Device::Cpu).unwrap();
    assert!(b.features1.equal(&again.features1));
    assert!(b.features2.equal(&again.features2));
    assert!(b.moves.equal(&again.moves));
}

#[test]
fn test_mini_batch_malformed() {
    let mut data = synthetic(4);
    data[2].game_result = 9;
    let dec = decoder::HcpBitPlanes;
    match mini_batch(&data, &dec, Device::Cpu) {
        Err(e @ TrainError::MalformedRecord { index : 2, .. }) =>
            assert!(e.to_string().starts_with("malformed record at index 2: in mini batch:")),
        _ => panic!("malformed record was accepted"),
    }
}

#[test]
fn test_sample() {
    use rand::SeedableRng;
    let data = synthetic(10);
    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let s = sample(&data, 25, &mut rng);
    assert_eq!(s.len(), 25);
    assert!(s.iter().all(|h| data.contains(h)));
}
