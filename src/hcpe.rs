use super::*;
use rayon::prelude::*;

/// bytes of huffman coded position.
pub const HCP_SIZE : usize = 32;
/// bytes of a position record.
/// hcp(32) + eval(2) + bestMove16(2) + gameResult(1) + dummy(1)
pub const RECORD_SIZE : usize = HCP_SIZE + 6;

pub const BOARD_SIZE : usize = 9;
pub const SQUARE_NB : usize = BOARD_SIZE * BOARD_SIZE;
/// UP .. UP2_RIGHT and their promoting versions.
pub const MOVE_DIRECTION_NUM : usize = 20;
pub const HAND_PIECE_NUM : usize = 7;
/// drops store the piece as pawn, lance, knight, silver, bishop, rook, gold.
/// hand pieces are ordered pawn, lance, knight, silver, gold, bishop, rook.
const DROP_TO_HAND_PIECE : [usize; HAND_PIECE_NUM] = [0, 1, 2, 3, 5, 6, 4];
pub const MAX_MOVE_LABEL_NUM : usize = MOVE_DIRECTION_NUM + HAND_PIECE_NUM;
/// size of policy output.
pub const MOVE_LABEL_NUM : usize = MAX_MOVE_LABEL_NUM * SQUARE_NB;

/// scale of evaluation to winning rate.
const EVAL_COEF : f32 = 756.0864962951762;
const PROMOTE_BIT : u16 = 1 << 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    White,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameResult {
    Draw,
    BlackWin,
    WhiteWin,
}

impl GameResult {
    pub fn from_u8(v : u8) -> Option<GameResult> {
        match v {
            0 => Some(GameResult::Draw),
            1 => Some(GameResult::BlackWin),
            2 => Some(GameResult::WhiteWin),
            _ => None,
        }
    }

    /// result seen from `color`. 1: win, 0: lose, 0.5: draw.
    pub fn label(&self, color : Color) -> f32 {
        match (self, color) {
            (GameResult::Draw, _) => 0.5,
            (GameResult::BlackWin, Color::Black) |
            (GameResult::WhiteWin, Color::White) => 1.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveDirection {
    Up,
    UpLeft,
    UpRight,
    Left,
    Right,
    Down,
    DownLeft,
    DownRight,
    Up2Left,
    Up2Right,
}

impl MoveDirection {
    /// `dir_x` : file of from - file of to.
    /// `dir_y` : rank of to - rank of from.
    fn from_displacement(dir_x : i32, dir_y : i32) -> Option<MoveDirection> {
        use MoveDirection::*;
        match (dir_x, dir_y) {
            (0, y) if y < 0 => Some(Up),
            (-1, -2) => Some(Up2Left),
            (1, -2) => Some(Up2Right),
            (x, y) if y < 0 && x < 0 => Some(UpLeft),
            (x, y) if y < 0 && x > 0 => Some(UpRight),
            (x, 0) if x < 0 => Some(Left),
            (x, 0) if x > 0 => Some(Right),
            (0, y) if y > 0 => Some(Down),
            (x, y) if y > 0 && x < 0 => Some(DownLeft),
            (x, y) if y > 0 && x > 0 => Some(DownRight),
            _ => None,
        }
    }
}

/// one position record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hcpe {
    pub hcp : [u8; HCP_SIZE],
    pub eval : i16,
    pub best_move16 : u16,
    pub game_result : u8,
    pub dummy : u8,
}

impl Hcpe {
    pub fn from_bytes(bytes : &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_SIZE {
            return None;
        }

        let mut hcp = [0u8; HCP_SIZE];
        hcp.copy_from_slice(&bytes[0..HCP_SIZE]);
        Some(Self {
            hcp,
            eval: i16::from_le_bytes([bytes[32], bytes[33]]),
            best_move16: u16::from_le_bytes([bytes[34], bytes[35]]),
            game_result: bytes[36],
            dummy: bytes[37],
        })
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut bytes = [0u8; RECORD_SIZE];
        bytes[0..HCP_SIZE].copy_from_slice(&self.hcp);
        bytes[32..34].copy_from_slice(&self.eval.to_le_bytes());
        bytes[34..36].copy_from_slice(&self.best_move16.to_le_bytes());
        bytes[36] = self.game_result;
        bytes[37] = self.dummy;
        bytes
    }

    /// side to move. the first bit of the huffman coded position.
    pub fn turn(&self) -> Color {
        if self.hcp[0] & 1 == 0 {Color::Black} else {Color::White}
    }

    /// game result from the side to move's view.
    pub fn result_label(&self) -> std::result::Result<f32, String> {
        GameResult::from_u8(self.game_result)
            .map(|r| r.label(self.turn()))
            .ok_or_else(|| format!("unknown game result {}", self.game_result))
    }

    /// winning rate estimated from the evaluation.
    pub fn value_label(&self) -> f32 {
        1.0 / (1.0 + (-(self.eval as f32) / EVAL_COEF).exp())
    }

    /// index of the policy output for the recorded move.
    ///
    /// 81 * direction + destination, seen from the side to move.
    pub fn move_label(&self) -> std::result::Result<i64, String> {
        let move16 = self.best_move16;
        let mut to_sq = (move16 & 0x7f) as usize;
        let mut from_sq = ((move16 >> 7) & 0x7f) as usize;
        if to_sq >= SQUARE_NB {
            return Err(format!("destination {to_sq} is off board"));
        }
        let white = self.turn() == Color::White;

        let direction = if from_sq < SQUARE_NB {
            if white {
                to_sq = SQUARE_NB - 1 - to_sq;
                from_sq = SQUARE_NB - 1 - from_sq;
            }
            let (to_x, to_y) = ((to_sq / BOARD_SIZE) as i32, (to_sq % BOARD_SIZE) as i32);
            let (from_x, from_y) =
                ((from_sq / BOARD_SIZE) as i32, (from_sq % BOARD_SIZE) as i32);
            let dir = MoveDirection::from_displacement(from_x - to_x, to_y - from_y)
                .ok_or_else(|| format!("move {move16:#06x} does not move"))?;
            if move16 & PROMOTE_BIT != 0 {
                dir as usize + 10
            } else {
                dir as usize
            }
        } else {
            if white {
                to_sq = SQUARE_NB - 1 - to_sq;
            }
            let piece = from_sq - SQUARE_NB;
            let Some(hand_piece) = DROP_TO_HAND_PIECE.get(piece) else {
                return Err(format!("unknown piece {piece} to drop"));
            };
            MOVE_DIRECTION_NUM + hand_piece
        };
        Ok((SQUARE_NB * direction + to_sq) as i64)
    }
}

/// read all records in `path`.
pub fn read_file(path : &str) -> Result<Vec<Hcpe>> {
    let bytes = std::fs::read(path).map_err(|e| TrainError::io(path, e))?;
    if bytes.len() % RECORD_SIZE != 0 {
        return Err(TrainError::malformed(
            bytes.len() / RECORD_SIZE,
            format!("{path}: {} trailing bytes", bytes.len() % RECORD_SIZE)));
    }
    Ok(bytes.chunks_exact(RECORD_SIZE)
        .filter_map(Hcpe::from_bytes)
        .collect())
}

/// write records to `path`.
pub fn write_file(path : &str, records : &[Hcpe]) -> Result<()> {
    let bytes = records.iter().flat_map(|r| r.to_bytes()).collect::<Vec<u8>>();
    std::fs::write(path, bytes).map_err(|e| TrainError::io(path, e))
}

/// load training files in the given order.
/// missing files are skipped.
pub fn load_training_data(files : &[String]) -> Result<Vec<Hcpe>> {
    let existing = files.iter().filter(|path| {
        if std::path::Path::new(path).exists() {
            log::debug!("{path}");
            true
        } else {
            log::debug!("{path} not found, skipping");
            false
        }
    }).collect::<Vec<_>>();

    let data = existing.par_iter()
        .map(|path| read_file(path))
        .collect::<Result<Vec<Vec<Hcpe>>>>()?
        .concat();
    if data.is_empty() {
        return Err(TrainError::NoTrainingData(files.to_vec()));
    }
    Ok(data)
}

#[cfg(test)]
pub fn record(turn : Color, from : usize, to : usize, promote : bool,
        result : GameResult, eval : i16) -> Hcpe {
    let mut hcp = [0u8; HCP_SIZE];
    hcp[0] = if turn == Color::White {1} else {0};
    let promote = if promote {PROMOTE_BIT} else {0};
    Hcpe {
        hcp,
        eval,
        best_move16: promote | ((from as u16) << 7) | to as u16,
        game_result: result as u8,
        dummy: 0,
    }
}

#[test]
fn test_bytes() {
    let mut rec = record(Color::White, 40, 31, false, GameResult::WhiteWin, -300);
    rec.hcp[5] = 0xa5;
    let bytes = rec.to_bytes();
    assert_eq!(bytes.len(), RECORD_SIZE);
    assert_eq!(bytes[32..34], (-300i16).to_le_bytes());
    assert_eq!(bytes[36], 2);
    assert_eq!(Hcpe::from_bytes(&bytes), Some(rec));
    assert_eq!(Hcpe::from_bytes(&bytes[..RECORD_SIZE - 1]), None);
}

#[test]
fn test_result_label() {
    let rec = record(Color::Black, 40, 31, false, GameResult::BlackWin, 0);
    assert_eq!(rec.result_label(), Ok(1.0));
    let rec = record(Color::White, 40, 31, false, GameResult::BlackWin, 0);
    assert_eq!(rec.result_label(), Ok(0.0));
    let rec = record(Color::White, 40, 31, false, GameResult::Draw, 0);
    assert_eq!(rec.result_label(), Ok(0.5));
    let mut rec = record(Color::Black, 40, 31, false, GameResult::Draw, 0);
    rec.game_result = 3;
    assert!(rec.result_label().is_err());
}

#[test]
fn test_value_label() {
    let rec = record(Color::Black, 40, 31, false, GameResult::Draw, 0);
    assert_eq!(rec.value_label(), 0.5);
    let win = record(Color::Black, 40, 31, false, GameResult::Draw, 756);
    let lose = record(Color::Black, 40, 31, false, GameResult::Draw, -756);
    assert!((win.value_label() - 0.7310586).abs() < 1e-4);
    assert!((win.value_label() + lose.value_label() - 1.0).abs() < 1e-6);
}

#[test]
fn test_move_label() {
    // 5e -> 5d, one rank forward for black.
    let rec = record(Color::Black, 40, 39, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok(39));
    // same move with promotion.
    let rec = record(Color::Black, 40, 39, true, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 10 + 39) as i64));
    // knight jumps.
    let rec = record(Color::Black, 40, 47, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 8 + 47) as i64));
    let rec = record(Color::Black, 40, 29, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 9 + 29) as i64));
    // one square to the right.
    let rec = record(Color::Black, 40, 31, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 4 + 31) as i64));
    // white moving towards rank 9 is forward after rotation.
    let rec = record(Color::White, 40, 41, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok(39));
    // dropping a knight.
    let rec = record(Color::Black, 81 + 2, 10, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 22 + 10) as i64));
    let rec = record(Color::White, 81 + 2, 10, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 22 + 70) as i64));
    // bishop, rook and gold are stored in a different order from hand pieces.
    let rec = record(Color::Black, 81 + 4, 10, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 25 + 10) as i64));
    let rec = record(Color::Black, 81 + 5, 10, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 26 + 10) as i64));
    let rec = record(Color::White, 81 + 6, 10, false, GameResult::Draw, 0);
    assert_eq!(rec.move_label(), Ok((81 * 24 + 70) as i64));

    let rec = record(Color::Black, 40, 40, false, GameResult::Draw, 0);
    assert!(rec.move_label().is_err());
    let rec = record(Color::Black, 81 + 7, 10, false, GameResult::Draw, 0);
    assert!(rec.move_label().is_err());
    let rec = record(Color::Black, 40, 90, false, GameResult::Draw, 0);
    assert!(rec.move_label().is_err());
}

#[test]
fn test_load_training_data() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.hcpe").to_str().unwrap().to_string();
    let b = dir.path().join("b.hcpe").to_str().unwrap().to_string();
    let missing = dir.path().join("none.hcpe").to_str().unwrap().to_string();
    let ra = vec![record(Color::Black, 40, 39, false, GameResult::Draw, 1); 3];
    let rb = vec![record(Color::White, 40, 41, false, GameResult::BlackWin, 2); 2];
    write_file(&a, &ra).unwrap();
    write_file(&b, &rb).unwrap();

    let data = load_training_data(&[a.clone(), missing.clone(), b]).unwrap();
    assert_eq!(data.len(), 5);
    assert_eq!(data[0], ra[0]);
    assert_eq!(data[4], rb[0]);

    assert!(matches!(load_training_data(&[missing]),
                     Err(TrainError::NoTrainingData(_))));

    std::fs::write(&a, [0u8; RECORD_SIZE + 1]).unwrap();
    assert!(matches!(read_file(&a),
                     Err(TrainError::MalformedRecord { .. })));
}
