//! Encode-resolution selection for the client role.
//!
//! The controller's `connect` envelope advertises the largest area it can
//! display; the client picks an encode size that fits it while preserving
//! the local screen's aspect ratio, then rounds both dimensions down to a
//! multiple of 16 (macroblock and hardware-encoder alignment).

/// -1 in either max field means the controller disabled adaptive resolution.
pub const ADAPTIVE_DISABLED: i32 = -1;

/// Pick the encode size for a local screen of `local` pixels given the
/// controller's max display area. The result is fixed for the session.
pub fn choose_encode_resolution(local: (u32, u32), max: (i32, i32)) -> (u32, u32) {
    let (local_w, local_h) = local;
    let (max_w, max_h) = max;

    let (w, h) = if max_w == ADAPTIVE_DISABLED || max_h == ADAPTIVE_DISABLED {
        (local_w, local_h)
    } else if local_w <= max_w as u32 && local_h <= max_h as u32 {
        (local_w, local_h)
    } else {
        // Scale to fit, preserving the local aspect ratio; whichever axis
        // saturates first wins.
        let local_aspect = local_w as f64 / local_h as f64;
        let max_aspect = max_w as f64 / max_h as f64;
        if local_aspect > max_aspect {
            (max_w as u32, (max_w as f64 / local_aspect) as u32)
        } else {
            ((max_h as f64 * local_aspect) as u32, max_h as u32)
        }
    };

    (align_down_16(w), align_down_16(h))
}

fn align_down_16(v: u32) -> u32 {
    (v & !15).max(16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_uses_local_resolution() {
        assert_eq!(
            choose_encode_resolution((1920, 1080), (ADAPTIVE_DISABLED, ADAPTIVE_DISABLED)),
            (1920, 1072)
        );
        assert_eq!(
            choose_encode_resolution((1920, 1080), (ADAPTIVE_DISABLED, 1080)),
            (1920, 1072)
        );
    }

    #[test]
    fn local_fits_within_max() {
        assert_eq!(choose_encode_resolution((1280, 720), (1920, 1080)), (1280, 720));
        // Exact fit counts as fitting.
        assert_eq!(choose_encode_resolution((1920, 1072), (1920, 1080)), (1920, 1072));
    }

    /// 2560x1440 screen, 1920x1080 viewer: same aspect, scale to the
    /// viewer's size, then align.
    #[test]
    fn scales_matching_aspect() {
        assert_eq!(choose_encode_resolution((2560, 1440), (1920, 1080)), (1920, 1072));
    }

    #[test]
    fn wider_local_saturates_width() {
        // 21:9 local on a 16:9 viewer: width saturates.
        let (w, h) = choose_encode_resolution((3440, 1440), (1920, 1080));
        assert_eq!(w, 1920);
        // 1920 / (3440/1440) = 803.7 → 803 → aligned 800
        assert_eq!(h, 800);
    }

    #[test]
    fn taller_local_saturates_height() {
        // Portrait local on a landscape viewer: height saturates.
        let (w, h) = choose_encode_resolution((1440, 2560), (1920, 1080));
        assert_eq!(h, 1072);
        // 1080 * (1440/2560) = 607.5 → 607 → aligned 592
        assert_eq!(w, 592);
    }

    #[test]
    fn output_fits_and_keeps_aspect() {
        let cases = [
            ((2560u32, 1440u32), (1920i32, 1080i32)),
            ((3840, 2160), (1280, 1024)),
            ((1366, 768), (1280, 720)),
            ((800, 600), (640, 480)),
        ];
        for (local, max) in cases {
            let (w, h) = choose_encode_resolution(local, max);
            assert!(w <= max.0 as u32, "{local:?} {max:?} → {w}x{h}");
            assert!(h <= max.1 as u32, "{local:?} {max:?} → {w}x{h}");
            assert_eq!(w % 16, 0);
            assert_eq!(h % 16, 0);
            // Aspect preserved within the slack a 16-pixel floor allows.
            let local_aspect = local.0 as f64 / local.1 as f64;
            let out_aspect = w as f64 / h as f64;
            assert!(
                (local_aspect - out_aspect).abs() / local_aspect < 0.05,
                "{local:?} {max:?} → {w}x{h}"
            );
        }
    }

    #[test]
    fn never_collapses_below_one_macroblock() {
        let (w, h) = choose_encode_resolution((20, 20), (16, 16));
        assert_eq!((w, h), (16, 16));
    }
}
