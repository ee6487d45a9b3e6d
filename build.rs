use std::env;
use std::path::PathBuf;

/// Location of a vcpkg FFmpeg install, if `VCPKG_ROOT` is set.
fn vcpkg_ffmpeg_dir() -> Option<PathBuf> {
    let root = env::var_os("VCPKG_ROOT")?;
    let triplet = env::var("VCPKGRS_TRIPLET").unwrap_or_else(|_| "x64-windows".to_string());
    Some(PathBuf::from(root).join("installed").join(triplet))
}

fn main() {
    for variable in ["FFMPEG_DIR", "VCPKG_ROOT", "VCPKGRS_TRIPLET"] {
        println!("cargo:rerun-if-env-changed={variable}");
    }

    // ffmpeg-sys-next finds FFmpeg through pkg-config everywhere but Windows.
    if env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("windows")
        || env::var_os("FFMPEG_DIR").is_some()
    {
        return;
    }

    match vcpkg_ffmpeg_dir() {
        Some(dir) if dir.exists() => println!(
            "cargo:warning=frameserve: found vcpkg FFmpeg at {0}; set FFMPEG_DIR={0} to use it",
            dir.display()
        ),
        Some(dir) => println!(
            "cargo:warning=frameserve: VCPKG_ROOT is set but {} does not exist",
            dir.display()
        ),
        None => println!(
            "cargo:warning=frameserve: set FFMPEG_DIR to an FFmpeg install for the H.264/H.265 decoder"
        ),
    }
}
