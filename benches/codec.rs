extern crate criterion;
extern crate kms;

use criterion::{criterion_group, criterion_main, Criterion};
use kms::core::crypto;
use kms::core::host::{Dispatcher, ServerIdentity};
use kms::core::kms::{KmsRequest, KmsVersion};
use kms::core::server::ServerConfig;
use kms::core::MemoryStore;
use uuid::Uuid;

fn v6_blob() -> Vec<u8> {
    let request = KmsRequest {
        version: KmsVersion::V6,
        is_client_vm: 0,
        license_status: 2,
        grace_time: 43200,
        application_id: kms::core::epid::APP_WINDOWS,
        sku_id: Uuid::from_u128(0x73111121_5638_40f6_bc11_f1d7b0d64300),
        kms_counted_id: Uuid::from_u128(0x212a64dc_43b1_4d3d_a30c_2fc69d2095c6),
        client_machine_id: Uuid::from_u128(0x794f_1f09),
        required_client_count: 25,
        request_time: 132_000_000_000_000_000,
        previous_client_machine_id: Uuid::nil(),
        machine_name: String::from("TESTPC"),
        hw_info: Some([0u8; 8]),
    };
    let mut body = request.to_bytes().unwrap();
    crypto::pad(&mut body);
    let iv = [7u8; 16];
    crypto::cbc_encrypt(&crypto::V6_KEY, &iv, &mut body).unwrap();

    let mut blob = KmsVersion::V6.as_u32().to_le_bytes().to_vec();
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&body);
    blob
}

fn criterion_benchmark(c: &mut Criterion) {
    let dispatcher = Dispatcher::new(
        ServerIdentity::new(&ServerConfig::default()),
        MemoryStore::new(),
    );
    let blob = v6_blob();

    let mut group = c.benchmark_group("activation");
    group.bench_function("v6 dispatch", |b| {
        b.iter(|| dispatcher.dispatch(&blob).unwrap())
    });
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
