fn main() {
    // Gather build-time information for `cli::fmt_build_info`.
    built::write_built_file().expect("Failed to acquire build-time information");

    println!("cargo:rerun-if-changed=build.rs");
}
