//! Build script for compiling the credit ledger Protocol Buffer definitions.

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proto_files = ["proto/credits/v1/credits.proto"];

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&proto_files, &["proto/"])?;

    for proto in &proto_files {
        println!("cargo:rerun-if-changed={proto}");
    }

    Ok(())
}
