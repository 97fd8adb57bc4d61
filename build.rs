const HEADER: &str = "include/intercept_bridge.h";

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/ffi");
    println!("cargo:rerun-if-changed={HEADER}");

    #[cfg(feature = "generate-header")]
    header::generate();
}

#[cfg(feature = "generate-header")]
mod header {
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    pub fn generate() {
        let Ok(crate_dir) = env::var("CARGO_MANIFEST_DIR").map(PathBuf::from) else {
            println!("cargo:warning=CARGO_MANIFEST_DIR unset; {} not refreshed", super::HEADER);
            return;
        };
        let output = crate_dir.join(super::HEADER);
        if let Some(dir) = output.parent() {
            if let Err(error) = fs::create_dir_all(dir) {
                panic!("cannot create {}: {error}", dir.display());
            }
        }

        let config = cbindgen::Config {
            language: cbindgen::Language::C,
            include_guard: Some("INTERCEPT_BRIDGE_H".to_string()),
            documentation: true,
            ..cbindgen::Config::default()
        };
        match cbindgen::Builder::new()
            .with_crate(&crate_dir)
            .with_config(config)
            .generate()
        {
            Ok(bindings) => {
                if bindings.write_to_file(&output) {
                    println!("cargo:warning=Updated {}", output.display());
                }
            }
            Err(error) => panic!("cbindgen failed: {error}"),
        }
    }
}
