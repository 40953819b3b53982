//! Aspect ratios accepted by the image model, and snapping of free-form
//! size strings onto them.

pub const SUPPORTED_ASPECT_RATIOS: &[(&str, f64)] = &[
    ("1:1", 1.0),
    ("2:3", 2.0 / 3.0),
    ("3:2", 3.0 / 2.0),
    ("3:4", 3.0 / 4.0),
    ("4:3", 4.0 / 3.0),
    ("4:5", 4.0 / 5.0),
    ("5:4", 5.0 / 4.0),
    ("9:16", 9.0 / 16.0),
    ("16:9", 16.0 / 9.0),
    ("21:9", 21.0 / 9.0),
];

#[derive(Debug, Clone, PartialEq)]
pub struct SnappedRatio {
    pub ratio: String,
    pub warning: Option<String>,
}

pub fn is_supported(raw: &str) -> bool {
    let normalized = raw.trim();
    SUPPORTED_ASPECT_RATIOS
        .iter()
        .any(|(candidate, _)| *candidate == normalized)
}

/// Snaps `WxH`, `W:H`, `W/H` and the words portrait/landscape/square onto
/// the nearest supported ratio. Returns `None` for input that is not a size.
pub fn snap_aspect_ratio(raw: &str) -> Option<SnappedRatio> {
    let normalized = raw.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        return None;
    }
    let named = match normalized.as_str() {
        "portrait" | "tall" => Some("3:4"),
        "landscape" | "wide" => Some("4:3"),
        "square" => Some("1:1"),
        "story" | "vertical" => Some("9:16"),
        _ => None,
    };
    if let Some(ratio) = named {
        return Some(SnappedRatio {
            ratio: ratio.to_string(),
            warning: None,
        });
    }

    let target_ratio = if let Some((left, right)) = parse_ratio(&normalized) {
        let direct = format!("{left}:{right}");
        if is_supported(&direct) {
            return Some(SnappedRatio {
                ratio: direct,
                warning: None,
            });
        }
        left as f64 / right as f64
    } else if let Some((width, height)) = parse_dims(&normalized) {
        width as f64 / height as f64
    } else {
        return None;
    };

    let mut best_key = "1:1";
    let mut best_delta = f64::MAX;
    for (key, ratio) in SUPPORTED_ASPECT_RATIOS {
        let delta = (ratio - target_ratio).abs();
        if delta < best_delta {
            best_key = key;
            best_delta = delta;
        }
    }
    Some(SnappedRatio {
        ratio: best_key.to_string(),
        warning: Some(format!("Aspect ratio '{raw}' snapped to {best_key}.")),
    })
}

pub fn parse_dims(raw: &str) -> Option<(u32, u32)> {
    let lowered = raw.trim().to_ascii_lowercase();
    let (left, right) = lowered.split_once('x')?;
    let width = left.trim().parse::<u32>().ok()?;
    let height = right.trim().parse::<u32>().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

pub fn parse_ratio(raw: &str) -> Option<(u32, u32)> {
    let (left, right) = if let Some(parts) = raw.split_once(':') {
        parts
    } else {
        raw.split_once('/')?
    };
    let first = left.trim().parse::<u32>().ok()?;
    let second = right.trim().parse::<u32>().ok()?;
    if first == 0 || second == 0 {
        return None;
    }
    Some((first, second))
}

/// Pixel dimensions for a ratio with the longest side set to `longest`.
pub fn dims_for_ratio(ratio: &str, longest: u32) -> (u32, u32) {
    let longest = longest.max(1);
    let Some((left, right)) = parse_ratio(ratio) else {
        return (longest, longest);
    };
    if left >= right {
        let height = ((longest as f64) * right as f64 / left as f64).round() as u32;
        (longest, height.max(1))
    } else {
        let width = ((longest as f64) * left as f64 / right as f64).round() as u32;
        (width.max(1), longest)
    }
}
