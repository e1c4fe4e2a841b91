//! Build script to generate gRPC bindings from the protobuf definition.

fn main() {
    println!("cargo:rerun-if-changed=proto/shardkv.proto");

    tonic_build::configure()
        .compile_protos(&["proto/shardkv.proto"], &["proto"])
        .unwrap();
}
