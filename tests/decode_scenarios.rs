use ptm_relight::ptm::{decode, DecodeError, PtmFormat, PtmSection};
use ptm_relight::shading::{render_reference, FrameParams, LightDirection, RenderMode};

fn ptm_bytes(format: &str, width: usize, height: usize, scale: &str, bias: &str, payload: &[u8]) -> Vec<u8> {
    let mut bytes =
        format!("PTM_1.2\n{format}\n{width} {height}\n{scale}\n{bias}\n").into_bytes();
    bytes.extend_from_slice(payload);
    bytes
}

/// LRGB payload whose a5 byte for file-order pixel `i` is `a5[i]`, all other
/// coefficients zero and color mid gray.
fn lrgb_with_a5(a5: &[u8]) -> Vec<u8> {
    let mut payload = Vec::new();
    for &value in a5 {
        payload.extend_from_slice(&[0, 0, 0, 0, 0, value]);
    }
    payload.extend(std::iter::repeat(128).take(a5.len() * 3));
    payload
}

#[test]
fn single_pixel_luminance_file_dequantizes_and_keeps_color() {
    let bytes = ptm_bytes(
        "PTM_FORMAT_LRGB",
        1,
        1,
        "2 1 1 1 1 1",
        "10 0 0 0 0 0",
        &[20, 100, 50, 30, 60, 128, 255, 128, 64],
    );

    let file = decode(&bytes).expect("1x1 LRGB should decode");
    assert_eq!(file.format(), PtmFormat::LuminanceRgb);
    let planes = file.coefficient_planes();
    assert_eq!(planes.len(), 6);
    assert_eq!(planes[0][0], 20.0);
    assert_eq!(planes[1][0], 100.0);
    assert_eq!(planes[5][0], 128.0);
    assert_eq!(file.base_color(), Some(&[255_u8, 128, 64][..]));
}

#[test]
fn rows_are_flipped_to_top_down_order() {
    let bytes = ptm_bytes(
        "PTM_FORMAT_LRGB",
        2,
        2,
        "1 1 1 1 1 1",
        "0 0 0 0 0 0",
        &lrgb_with_a5(&[10, 20, 30, 40]),
    );

    let file = decode(&bytes).expect("2x2 LRGB should decode");
    assert_eq!(file.coefficient_planes()[5], vec![30.0, 40.0, 10.0, 20.0]);
}

#[test]
fn non_square_files_flip_every_row() {
    // 3 wide, 4 tall. File row r holds values 10*r + x.
    let a5: Vec<u8> = (0..4_u8)
        .flat_map(|row| (0..3_u8).map(move |x| row * 10 + x))
        .collect();
    let bytes = ptm_bytes(
        "PTM_FORMAT_LRGB",
        3,
        4,
        "1 1 1 1 1 1",
        "0 0 0 0 0 0",
        &lrgb_with_a5(&a5),
    );

    let file = decode(&bytes).expect("3x4 LRGB should decode");
    assert_eq!((file.width(), file.height()), (3, 4));
    for y in 0..4_u32 {
        let file_row = 3 - y;
        for x in 0..3_u32 {
            let expected = (file_row * 10 + x) as f32;
            assert_eq!(
                file.coefficient_at(5, x, y),
                [expected; 3],
                "pixel ({x}, {y})"
            );
        }
    }
}

#[test]
fn per_channel_files_store_each_channel_block() {
    // 1x1, R block coefficients 1..=6, G block 11..=16, B block 21..=26.
    let mut payload = Vec::new();
    for base in [1_u8, 11, 21] {
        payload.extend((0..6).map(|i| base + i));
    }
    let bytes = ptm_bytes("PTM_FORMAT_RGB", 1, 1, "1 1 1 1 1 1", "0 0 0 0 0 0", &payload);

    let file = decode(&bytes).expect("1x1 RGB should decode");
    assert_eq!(file.format(), PtmFormat::PerChannelRgb);
    assert_eq!(file.coefficient_planes().len(), 18);
    assert!(file.base_color().is_none());
    assert_eq!(file.coefficient_rgb(0, 0), [1.0, 11.0, 21.0]);
    assert_eq!(file.coefficient_rgb(5, 0), [6.0, 16.0, 26.0]);
    assert_eq!(file.coefficient_planes()[2 * 3 + 1][0], 13.0);
}

#[test]
fn per_channel_files_flip_every_row_in_every_block() {
    // 2 wide, 3 tall. a5 of file-order pixel i is 10*row + x, offset per
    // channel block by 0 (R), 100 (G) and 200 (B).
    let (width, height) = (2_u8, 3_u8);
    let mut payload = Vec::new();
    for channel_offset in [0_u8, 100, 200] {
        for row in 0..height {
            for x in 0..width {
                payload.extend_from_slice(&[0, 0, 0, 0, 0, channel_offset + row * 10 + x]);
            }
        }
    }
    let bytes = ptm_bytes("PTM_FORMAT_RGB", 2, 3, "1 1 1 1 1 1", "0 0 0 0 0 0", &payload);

    let file = decode(&bytes).expect("2x3 RGB should decode");
    assert_eq!((file.width(), file.height()), (2, 3));
    for y in 0..3_u32 {
        let file_row = 2 - y;
        for x in 0..2_u32 {
            let value = (file_row * 10 + x) as f32;
            assert_eq!(
                file.coefficient_at(5, x, y),
                [value, value + 100.0, value + 200.0],
                "pixel ({x}, {y})"
            );
            assert_eq!(file.coefficient_at(0, x, y), [0.0; 3]);
        }
    }
}

#[test]
fn per_channel_payload_must_cover_all_three_blocks() {
    let payload = vec![0_u8; 2 * 6 * 2];
    let bytes = ptm_bytes("PTM_FORMAT_RGB", 2, 1, "1 1 1 1 1 1", "0 0 0 0 0 0", &payload);

    let err = decode(&bytes).expect_err("short RGB payload should fail");
    assert_eq!(
        err,
        DecodeError::UnexpectedEndOfData {
            section: PtmSection::Coefficients,
            expected: 36,
            available: 24,
        }
    );
}

#[test]
fn unsupported_version_and_format_are_rejected() {
    let err = decode(b"PTM_1.1\nPTM_FORMAT_LRGB\n1 1\n").expect_err("old version");
    assert_eq!(err, DecodeError::UnsupportedVersion("PTM_1.1".to_owned()));

    let err = decode(b"PTM_1.2\nPTM_FORMAT_JPEG_LRGB\n1 1\n").expect_err("jpeg variant");
    assert_eq!(
        err,
        DecodeError::UnsupportedFormat("PTM_FORMAT_JPEG_LRGB".to_owned())
    );
}

#[test]
fn empty_input_reports_missing_header() {
    let err = decode(b"").expect_err("empty input");
    assert!(matches!(
        err,
        DecodeError::UnexpectedEndOfData {
            section: PtmSection::Header,
            ..
        }
    ));
}

#[test]
fn reference_render_of_flat_gray_file() {
    // a5 = 128 everywhere, base color 128: default mode yields (128/255)^2.
    let bytes = ptm_bytes(
        "PTM_FORMAT_LRGB",
        2,
        2,
        "1 1 1 1 1 1",
        "0 0 0 0 0 0",
        &lrgb_with_a5(&[128; 4]),
    );
    let file = decode(&bytes).expect("flat file should decode");

    let params = FrameParams {
        light: LightDirection { u: 0.3, v: -0.2 },
        ..FrameParams::default()
    };
    let rgba = render_reference(&file, &params, 4, 4).expect("reference render");
    assert_eq!(rgba.len(), 4 * 4 * 4);
    let expected = ((128.0_f32 / 255.0) * (128.0 / 255.0) * 255.0).round() as u8;
    for pixel in rgba.chunks_exact(4) {
        assert_eq!(pixel, [expected, expected, expected, 255]);
    }
}

#[test]
fn unknown_mode_renders_magenta_everywhere() {
    let bytes = ptm_bytes(
        "PTM_FORMAT_LRGB",
        1,
        1,
        "1 1 1 1 1 1",
        "0 0 0 0 0 0",
        &[9, 8, 7, 6, 5, 4, 3, 2, 1],
    );
    let file = decode(&bytes).expect("file should decode");

    let params = FrameParams {
        mode: RenderMode::Unrecognized(7),
        ..FrameParams::default()
    };
    let rgba = render_reference(&file, &params, 3, 2).expect("reference render");
    for pixel in rgba.chunks_exact(4) {
        assert_eq!(pixel, [255, 0, 255, 255]);
    }
}
