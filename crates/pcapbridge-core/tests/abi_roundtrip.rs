use pcapbridge_core::abi::layout::FieldWidth;
use pcapbridge_core::{AbiError, AbiVariant, ByteOrder, HeaderAbi, PacketHeader, TimestampPrecision};
use proptest::prelude::*;

fn any_abi() -> impl Strategy<Value = HeaderAbi> {
    (
        prop::sample::select(AbiVariant::ALL.to_vec()),
        prop::sample::select(vec![ByteOrder::Little, ByteOrder::Big]),
    )
        .prop_map(|(variant, order)| HeaderAbi::new(variant, order))
}

#[test]
fn header_encode_decode() {
    proptest!(ProptestConfig::with_cases(512), |(
        abi in any_abi(),
        ts_sec in i64::from(i32::MIN)..=i64::from(i32::MAX),
        frac_seed in any::<u32>(),
        caplen in any::<u32>(),
        len in any::<u32>(),
    )| {
        let precision = abi.precision();
        let ts_frac = frac_seed % precision.units_per_second();
        let header = PacketHeader::new(ts_sec, ts_frac, precision, caplen, len);

        let mut raw = vec![0xffu8; abi.header_len() + 3];
        abi.encode(&header, &mut raw).unwrap();
        prop_assert_eq!(abi.decode(&raw).unwrap(), header);
        prop_assert_eq!(abi.decode(&raw[..abi.header_len()]).unwrap(), header);
    });
}

#[test]
fn short_buffers_are_rejected() {
    proptest!(ProptestConfig::with_cases(128), |(abi in any_abi(), cut in 0usize..32)| {
        let actual = cut % abi.header_len();
        let raw = vec![0u8; actual];
        prop_assert_eq!(
            abi.decode(&raw),
            Err(AbiError::TooShort { needed: abi.header_len(), actual })
        );
    });
}

#[test]
fn wide_seconds_only_fit_64_bit_layouts() {
    let header = PacketHeader::new(
        i64::from(i32::MAX) + 1,
        0,
        TimestampPrecision::Micro,
        1,
        1,
    );
    for variant in AbiVariant::ALL {
        let abi = HeaderAbi::new(variant, ByteOrder::Little);
        let header = PacketHeader { precision: abi.precision(), ..header };
        let mut raw = vec![0u8; abi.header_len()];
        let result = abi.encode(&header, &mut raw);
        if matches!(abi.table().seconds.width, FieldWidth::U32) {
            assert!(matches!(result, Err(AbiError::OutOfRange { field: "seconds", .. })));
        } else {
            result.unwrap();
            assert_eq!(abi.timestamp_seconds(&raw), header.ts_sec);
        }
    }
}
