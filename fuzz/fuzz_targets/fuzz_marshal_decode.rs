//! Fuzz target: `Marshaller::decode` / `decode_preserving`
//!
//! Feeds arbitrary bytes to the schema-driven decoder over a schema with
//! every scalar kind, packed lists and a self-recursive message. Decoding
//! must never panic; anything `decode_preserving` accepts must re-encode,
//! and the re-encoded bytes must decode again.
//!
//! cargo fuzz run fuzz_marshal_decode

#![no_main]

use std::sync::{Arc, OnceLock};

use libfuzzer_sys::fuzz_target;
use protobridge::rpc::marshal::{MarshalLimits, Marshaller};
use protobridge::schema::{
    DescriptorRegistry, FieldDescriptor as F, FieldType as T, MessageDescriptor, RegistryBuilder,
};

fn registry() -> Arc<DescriptorRegistry> {
    let mut b = RegistryBuilder::new();
    b.message(MessageDescriptor::new(
        "fuzz.Node",
        vec![
            F::new("b", 1, T::Bool),
            F::new("i32", 2, T::Int32),
            F::new("i64", 3, T::Int64),
            F::new("u32", 4, T::UInt32),
            F::new("u64", 5, T::UInt64),
            F::new("s32", 6, T::SInt32),
            F::new("s64", 7, T::SInt64),
            F::new("f32", 8, T::Fixed32),
            F::new("f64", 9, T::Fixed64),
            F::new("sf32", 10, T::SFixed32),
            F::new("sf64", 11, T::SFixed64),
            F::new("flt", 12, T::Float),
            F::new("dbl", 13, T::Double),
            F::new("str", 14, T::String),
            F::new("raw", 15, T::Bytes),
            F::new("kind", 16, T::Enum),
            F::new("nums", 17, T::SInt64).repeated(),
            F::new("child", 18, T::Message("fuzz.Node".into())),
            F::new("kids", 19, T::Message("fuzz.Node".into())).repeated(),
            F::new("opt", 20, T::UInt32).optional(),
            F::new("attrs", 21, T::map(T::Int64, T::Message("fuzz.Node".into()))),
        ],
    ))
    .expect("schema");
    b.build().expect("registry")
}

fn marshaller() -> &'static Marshaller {
    static M: OnceLock<Marshaller> = OnceLock::new();
    M.get_or_init(|| {
        Marshaller::new(
            registry(),
            MarshalLimits {
                max_depth: 16,
                max_field_bytes: 1 << 16,
            },
        )
    })
}

fuzz_target!(|data: &[u8]| {
    let m = marshaller();
    let _ = m.decode(data, "fuzz.Node");

    if let Ok(obj) = m.decode_preserving(data, "fuzz.Node") {
        let bytes = m
            .encode(&obj, "fuzz.Node")
            .expect("decoded object must re-encode");
        m.decode_preserving(&bytes, "fuzz.Node")
            .expect("re-encoded bytes must decode");
    }
});
