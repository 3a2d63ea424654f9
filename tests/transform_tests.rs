mod common;

use common::{TEST_KEY, random_bytes};
use std::io::Cursor;
use tokio::io::AsyncReadExt;
use walvault::services::transform::{self, IV_LEN, SecretKey, TransformError};

async fn encode_all(data: Vec<u8>, key: &SecretKey) -> (Vec<u8>, u64) {
    let (mut frame, task) = transform::encode(Cursor::new(data), key).unwrap();
    let mut out = Vec::new();
    frame.read_to_end(&mut out).await.unwrap();
    (out, task.wait().await.unwrap())
}

async fn decode_all(frame: Vec<u8>, key: &SecretKey) -> Result<(Vec<u8>, u64), TransformError> {
    let (mut plaintext, task) = transform::decode(Cursor::new(frame), key)?;
    let mut out = Vec::new();
    let read = plaintext.read_to_end(&mut out).await;
    drop(plaintext);
    let produced = task.wait().await?;
    read.map_err(TransformError::Io)?;
    Ok((out, produced))
}

#[tokio::test]
async fn ten_mebibytes_round_trip() {
    let key = SecretKey::new(TEST_KEY.to_vec()).unwrap();
    let data = random_bytes(10 * 1024 * 1024, 1);

    let (frame, consumed) = encode_all(data.clone(), &key).await;
    assert_eq!(consumed, data.len() as u64);
    assert!(frame.len() > IV_LEN);

    let (decoded, produced) = decode_all(frame, &key).await.unwrap();
    assert_eq!(produced, data.len() as u64);
    assert!(decoded == data);
}

#[tokio::test]
async fn every_key_size_round_trips() {
    for len in [16usize, 24, 32] {
        let key = SecretKey::new(vec![0x42; len]).unwrap();
        let data = random_bytes(300 * 1024, len as u64);
        let (frame, _) = encode_all(data.clone(), &key).await;
        let (decoded, _) = decode_all(frame, &key).await.unwrap();
        assert!(decoded == data, "key length {len}");
    }
}

#[tokio::test]
async fn empty_input_round_trips() {
    let key = SecretKey::new(TEST_KEY.to_vec()).unwrap();
    let (frame, consumed) = encode_all(Vec::new(), &key).await;
    assert_eq!(consumed, 0);
    let (decoded, produced) = decode_all(frame, &key).await.unwrap();
    assert!(decoded.is_empty());
    assert_eq!(produced, 0);
}

#[tokio::test]
async fn each_frame_gets_a_fresh_iv() {
    let key = SecretKey::new(TEST_KEY.to_vec()).unwrap();
    let data = random_bytes(64 * 1024, 2);
    let (first, _) = encode_all(data.clone(), &key).await;
    let (second, _) = encode_all(data, &key).await;
    assert_ne!(first[..IV_LEN], second[..IV_LEN]);
    assert_ne!(first, second);
}

#[tokio::test]
async fn ciphertext_hides_plaintext() {
    let key = SecretKey::new(TEST_KEY.to_vec()).unwrap();
    let data = b"PGDMP custom archive header, repeated. ".repeat(1000);
    let (frame, _) = encode_all(data.clone(), &key).await;
    let needle = &data[..32];
    assert!(!frame.windows(needle.len()).any(|window| window == needle));
}

#[tokio::test]
async fn frame_shorter_than_iv_is_rejected() {
    let key = SecretKey::new(TEST_KEY.to_vec()).unwrap();
    let err = decode_all(vec![0u8; IV_LEN - 1], &key).await.unwrap_err();
    assert!(matches!(err, TransformError::TruncatedFrame));
}

#[tokio::test]
async fn wrong_key_fails_to_decode() {
    let key = SecretKey::new(TEST_KEY.to_vec()).unwrap();
    let other = SecretKey::new(b"fedcba9876543210".to_vec()).unwrap();
    let (frame, _) = encode_all(random_bytes(8 * 1024, 3), &key).await;
    assert!(decode_all(frame, &other).await.is_err());
}

#[tokio::test]
async fn bytes_after_the_trailer_are_rejected() {
    let key = SecretKey::new(TEST_KEY.to_vec()).unwrap();
    let (mut frame, _) = encode_all(random_bytes(4 * 1024, 4), &key).await;
    frame.extend_from_slice(b"junk");
    let err = decode_all(frame, &key).await.unwrap_err();
    assert!(matches!(err, TransformError::TrailingData(4)));
}
