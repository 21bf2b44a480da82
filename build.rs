fn main() {
    // ONNX messages, generated with the pure-Rust parser so no protoc is needed
    protobuf_codegen::Codegen::new()
        .pure()
        .includes(["src/protos"])
        .input("src/protos/onnx.proto")
        .cargo_out_dir("onnx-protos")
        .run_from_script();
}
