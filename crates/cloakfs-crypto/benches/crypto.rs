use std::sync::Arc;

use cloakfs_crypto::{ContentEnc, CryptoCore, MasterKey, NameTransform};

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn content_enc(iv_len: usize) -> ContentEnc {
    let core = CryptoCore::new(&MasterKey::from_bytes([0xABu8; 32]), iv_len).unwrap();
    ContentEnc::new(Arc::new(core))
}

#[divan::bench(args = [12, 16])]
fn bench_encrypt_block(bencher: divan::Bencher, iv_len: usize) {
    let enc = content_enc(iv_len);
    let file_id = [0xCDu8; 16];
    let data = make_data(4096);
    bencher
        .counter(divan::counter::BytesCount::new(4096usize))
        .bench(|| {
            enc.encrypt_block(divan::black_box(&data), 0, divan::black_box(&file_id))
                .unwrap()
        });
}

#[divan::bench(args = [12, 16])]
fn bench_decrypt_block(bencher: divan::Bencher, iv_len: usize) {
    let enc = content_enc(iv_len);
    let file_id = [0xCDu8; 16];
    let block = enc.encrypt_block(&make_data(4096), 0, &file_id).unwrap();
    bencher
        .counter(divan::counter::BytesCount::new(4096usize))
        .bench(|| {
            enc.decrypt_block(divan::black_box(&block), 0, divan::black_box(&file_id))
                .unwrap()
        });
}

#[divan::bench]
fn bench_encrypt_name(bencher: divan::Bencher) {
    let core = CryptoCore::new(&MasterKey::from_bytes([0xABu8; 32]), 16).unwrap();
    let names = NameTransform::new(Arc::new(core), false);
    let iv = [0x42u8; 16];
    bencher.bench(|| {
        names
            .encrypt_name(divan::black_box("a-typical-filename.tar.gz"), &iv)
            .unwrap()
    });
}

fn main() {
    divan::main();
}
