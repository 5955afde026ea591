fn main() {
    prost_build::compile_protos(&["proto/netfuse.proto"], &["proto/"])
        .expect("failed to compile netfuse.proto");
}
