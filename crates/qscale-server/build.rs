fn main() -> Result<(), Box<dyn std::error::Error>> {
    if std::env::var_os("PROTOC").is_none() {
        if let Ok(protoc) = protoc_bin_vendored::protoc_bin_path() {
            // SAFETY: build scripts are single-threaded at this point.
            unsafe {
                std::env::set_var("PROTOC", protoc);
            }
        }
    }
    tonic_build::compile_protos("proto/externalscaler.proto")?;
    Ok(())
}
