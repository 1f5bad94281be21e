//! Postal code detection and coarse coordinate resolution.

use std::sync::LazyLock;

use regex::Regex;

use crate::models::GeoPoint;

static POSTAL_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:\bS\(?|\b)(\d{6})\b").unwrap());

/// Postal sectors (first two digits) grouped by district, with an
/// approximate district centroid.
const DISTRICTS: &[(&[u8], GeoPoint)] = &[
    (&[1, 2, 3, 4, 5, 6], GeoPoint { lat: 1.2840, lon: 103.8510 }),
    (&[7, 8], GeoPoint { lat: 1.2765, lon: 103.8430 }),
    (&[14, 15, 16], GeoPoint { lat: 1.2870, lon: 103.8090 }),
    (&[9, 10], GeoPoint { lat: 1.2650, lon: 103.8220 }),
    (&[11, 12, 13], GeoPoint { lat: 1.3000, lon: 103.7800 }),
    (&[17], GeoPoint { lat: 1.2915, lon: 103.8490 }),
    (&[18, 19], GeoPoint { lat: 1.3000, lon: 103.8560 }),
    (&[20, 21], GeoPoint { lat: 1.3080, lon: 103.8520 }),
    (&[22, 23], GeoPoint { lat: 1.3050, lon: 103.8320 }),
    (&[24, 25, 26, 27], GeoPoint { lat: 1.3200, lon: 103.8000 }),
    (&[28, 29, 30], GeoPoint { lat: 1.3200, lon: 103.8420 }),
    (&[31, 32, 33], GeoPoint { lat: 1.3310, lon: 103.8500 }),
    (&[34, 35, 36, 37], GeoPoint { lat: 1.3350, lon: 103.8790 }),
    (&[38, 39, 40, 41], GeoPoint { lat: 1.3180, lon: 103.8930 }),
    (&[42, 43, 44, 45], GeoPoint { lat: 1.3030, lon: 103.9050 }),
    (&[46, 47, 48], GeoPoint { lat: 1.3240, lon: 103.9300 }),
    (&[49, 50, 81], GeoPoint { lat: 1.3570, lon: 103.9870 }),
    (&[51, 52], GeoPoint { lat: 1.3530, lon: 103.9450 }),
    (&[53, 54, 55, 82], GeoPoint { lat: 1.3710, lon: 103.8920 }),
    (&[56, 57], GeoPoint { lat: 1.3620, lon: 103.8440 }),
    (&[58, 59], GeoPoint { lat: 1.3400, lon: 103.7760 }),
    (&[60, 61, 62, 63, 64], GeoPoint { lat: 1.3400, lon: 103.7060 }),
    (&[65, 66, 67, 68], GeoPoint { lat: 1.3720, lon: 103.7500 }),
    (&[69, 70, 71], GeoPoint { lat: 1.4100, lon: 103.7100 }),
    (&[72, 73], GeoPoint { lat: 1.4360, lon: 103.7860 }),
    (&[77, 78], GeoPoint { lat: 1.3970, lon: 103.8180 }),
    (&[75, 76], GeoPoint { lat: 1.4290, lon: 103.8350 }),
    (&[79, 80], GeoPoint { lat: 1.3990, lon: 103.8690 }),
];

/// First 6-digit postal code in the text whose sector is known.
pub fn postal_code(text: &str) -> Option<String> {
    POSTAL_CODE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .find(|code| resolve(code).is_some())
}

/// Whether `code` looks like a postal code this resolver understands.
pub fn is_valid_postal_code(code: &str) -> bool {
    code.len() == 6 && code.bytes().all(|b| b.is_ascii_digit()) && resolve(code).is_some()
}

/// Coordinates of the district containing `code`.
pub fn resolve(code: &str) -> Option<GeoPoint> {
    let sector: u8 = code.get(..2)?.parse().ok()?;
    DISTRICTS
        .iter()
        .find(|(sectors, _)| sectors.contains(&sector))
        .map(|(_, point)| *point)
}
