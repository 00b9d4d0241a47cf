// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use assert_cmd::Command;
use image::{Rgba, RgbaImage};
use predicates::prelude::*;
use std::path::Path;
use tempfile::TempDir;

fn write_palette(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("palette.png");
    RgbaImage::from_fn(16, 1, |x, _| Rgba([x as u8 * 16, 255 - x as u8 * 16, 64, 255]))
        .save(&path)
        .unwrap();
    path
}

fn mandel() -> Command {
    Command::cargo_bin("mandel").unwrap()
}

#[test]
fn renders_to_the_named_file() {
    let dir = TempDir::new().unwrap();
    let palette = write_palette(dir.path());
    let output = dir.path().join("out.png");

    mandel()
        .arg("-p")
        .arg(&palette)
        .arg("-o")
        .arg(&output)
        .args(&["-s", "128x64", "-g", "16", "-d", "128", "-b", "host", "-t", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Time = "));

    let image = image::open(&output).unwrap().to_rgba8();
    assert_eq!(image.dimensions(), (128, 64));
    assert_eq!(*image.get_pixel(64, 32), Rgba([0, 0, 0, 255]));
}

#[test]
fn info_describes_the_device() {
    let dir = TempDir::new().unwrap();
    let palette = write_palette(dir.path());

    mandel()
        .arg("-p")
        .arg(&palette)
        .arg("-o")
        .arg(dir.path().join("out.png"))
        .args(&["-s", "32x32", "-g", "8", "-d", "16", "-i"])
        .assert()
        .success()
        .stdout(predicate::str::is_match("(?s)^host, .*\n\nTime = ").unwrap());
}

#[test]
fn negative_real_ranges_are_accepted() {
    let dir = TempDir::new().unwrap();
    let palette = write_palette(dir.path());
    let output = dir.path().join("out.png");

    mandel()
        .arg("-p")
        .arg(&palette)
        .arg("-o")
        .arg(&output)
        .args(&["-s", "32x32", "-g", "8", "-d", "16", "-r", "-1.5,-0.5"])
        .assert()
        .success();
    assert!(output.exists());
}

#[test]
fn indivisible_sizes_are_refused() {
    let dir = TempDir::new().unwrap();
    let palette = write_palette(dir.path());
    let output = dir.path().join("out.png");

    mandel()
        .arg("-p")
        .arg(&palette)
        .arg("-o")
        .arg(&output)
        .args(&["-s", "1000x1000", "-g", "32"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Render failure"));
    assert!(!output.exists());
}

#[test]
fn missing_palette_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("out.png");

    mandel()
        .arg("-p")
        .arg(dir.path().join("nowhere.png"))
        .arg("-o")
        .arg(&output)
        .args(&["-s", "32x32", "-g", "8"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("palette"));
    assert!(!output.exists());
}

#[test]
fn malformed_sizes_are_rejected() {
    mandel()
        .args(&["-s", "big"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Could not parse output image size"));
}

#[test]
fn unknown_backends_are_rejected() {
    mandel().args(&["-b", "abacus"]).assert().failure();
}
