use mv_core::cipher::{decrypt, encrypt, ENCRYPTION_OVERHEAD};

fn test_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = i as u8;
    }
    key
}

#[test]
fn round_trip_restores_plaintext() {
    let key = test_key();
    let plaintext = b"the facts never left the machine unencrypted";
    let blob = encrypt(&key, plaintext).expect("encrypt");
    assert_eq!(blob.len(), plaintext.len() + ENCRYPTION_OVERHEAD);
    let recovered = decrypt(&key, &blob).expect("decrypt");
    assert_eq!(recovered, plaintext);
}

#[test]
fn fresh_nonce_per_call() {
    let key = test_key();
    let a = encrypt(&key, b"same message").expect("first encrypt");
    let b = encrypt(&key, b"same message").expect("second encrypt");
    assert_ne!(a, b);
}

#[test]
fn flipped_byte_is_tampering() {
    let key = test_key();
    let mut blob = encrypt(&key, b"payload").expect("encrypt");
    let middle = blob.len() / 2;
    blob[middle] ^= 0x01;
    let err = decrypt(&key, &blob).expect_err("tampered blob should fail");
    assert_eq!(err.code, "MV_CIPHER_TAMPERED");
}

#[test]
fn wrong_key_is_tampering() {
    let blob = encrypt(&test_key(), b"payload").expect("encrypt");
    let err = decrypt(&[0xAA; 32], &blob).expect_err("wrong key should fail");
    assert_eq!(err.code, "MV_CIPHER_TAMPERED");
}

#[test]
fn truncated_blob_is_tampering() {
    let err = decrypt(&test_key(), &[0u8; ENCRYPTION_OVERHEAD - 1])
        .expect_err("short blob should fail");
    assert_eq!(err.code, "MV_CIPHER_TAMPERED");
}
