use super::*;
use hcpe::{Hcpe, SQUARE_NB};

/// turns a position record into input planes of the network.
///
/// implement this for a full shogi feature extractor.
/// `decode` receives buffers of `features1_num() * 81` and
/// `features2_num() * 81` floats, zero filled.
pub trait PositionDecoder : Sync {
    fn features1_num(&self) -> usize;
    fn features2_num(&self) -> usize;
    fn decode(&self, hcpe : &Hcpe, features1 : &mut [f32], features2 : &mut [f32])
        -> std::result::Result<(), String>;
}

/// exposes the bits of the huffman coded position as they are.
///
/// features1: 256 bits spread over 4 planes in bit order, rest is zero.
/// features2: one plane filled with 1 when white is to move.
#[derive(Debug, Default, Clone, Copy)]
pub struct HcpBitPlanes;

const HCP_BITS : usize = hcpe::HCP_SIZE * 8;

impl PositionDecoder for HcpBitPlanes {
    fn features1_num(&self) -> usize {
        HCP_BITS.div_ceil(SQUARE_NB)
    }

    fn features2_num(&self) -> usize {
        1
    }

    fn decode(&self, hcpe : &Hcpe, features1 : &mut [f32], features2 : &mut [f32])
            -> std::result::Result<(), String> {
        if features1.len() < HCP_BITS || features2.len() < SQUARE_NB {
            return Err(format!("buffer too small: {} {}", features1.len(), features2.len()));
        }

        for (i, v) in features1.iter_mut().take(HCP_BITS).enumerate() {
            *v = ((hcpe.hcp[i / 8] >> (i % 8)) & 1) as f32;
        }
        if hcpe.turn() == hcpe::Color::White {
            features2.fill(1.0);
        }
        Ok(())
    }
}

#[test]
fn test_hcp_bit_planes() {
    let dec = HcpBitPlanes;
    assert_eq!(dec.features1_num(), 4);
    assert_eq!(dec.features2_num(), 1);

    let mut rec = hcpe::record(
        hcpe::Color::White, 40, 41, false, hcpe::GameResult::Draw, 0);
    rec.hcp[1] = 0b1000_0010;
    let mut f1 = vec![0f32; 4 * SQUARE_NB];
    let mut f2 = vec![0f32; SQUARE_NB];
    dec.decode(&rec, &mut f1, &mut f2).unwrap();
    assert_eq!(f1[0], 1.0);
    assert_eq!(f1[9], 1.0);
    assert_eq!(f1[15], 1.0);
    assert_eq!(f1.iter().sum::<f32>(), 3.0);
    assert!(f2.iter().all(|&v| v == 1.0));

    let mut small = vec![0f32; 10];
    assert!(dec.decode(&rec, &mut small, &mut f2).is_err());
}
