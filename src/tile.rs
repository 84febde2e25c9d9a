//! Resolves a product title into the tile-grid prefix its files live under
//! in the public bucket.
//!
//! Titles follow the fixed SAFE naming convention, e.g.
//! `S2A_MSIL2A_20250315T104619_N0511_R008_T31UDA_20250315T133000`. The
//! tile designator encodes grid zone (`31`), latitude band (`U`) and
//! square (`DA`); the sensing date supplies year and month. The grammar is
//! validated as a whole rather than sliced at fixed offsets, so a
//! nonconforming title is rejected with a named error instead of
//! producing a silently wrong prefix.

use regex::Regex;

use crate::error::FetchError;

const TITLE_PATTERN: &str = r"^S2[A-D]_MSI(?:L1C|L2A)_(?<year>\d{4})(?<month>\d{2})(?<day>\d{2})T\d{6}_N\d{4}_R\d{3}_T(?<zone>\d{2})(?<band>[C-HJ-NP-X])(?<square>[A-Z]{2})_\d{8}T\d{6}(?:\.SAFE)?$";

/// Decoded tile-grid components of a product title.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePath {
    pub grid_zone: u8,
    pub latitude_band: char,
    pub square: String,
    pub year: u16,
    pub month: u8,
}

impl TilePath {
    /// Storage-key prefix for the product's files. Zone and month carry no
    /// leading zeros, matching the bucket layout.
    pub fn prefix(&self) -> String {
        format!(
            "tiles/{}/{}/{}/{}/{}",
            self.grid_zone, self.latitude_band, self.square, self.year, self.month
        )
    }
}

/// Parse a product title into its tile-grid components.
pub fn resolve(title: &str) -> Result<TilePath, FetchError> {
    let re = Regex::new(TITLE_PATTERN).expect("Regex pattern should always compile");

    let captures = re.captures(title).ok_or_else(|| malformed(
        title,
        "does not match the SAFE product naming grammar",
    ))?;

    let year: u16 = captures["year"]
        .parse()
        .map_err(|_| malformed(title, "unparsable sensing year"))?;
    let month: u8 = captures["month"]
        .parse()
        .map_err(|_| malformed(title, "unparsable sensing month"))?;
    let grid_zone: u8 = captures["zone"]
        .parse()
        .map_err(|_| malformed(title, "unparsable grid zone"))?;
    let latitude_band = captures["band"]
        .chars()
        .next()
        .expect("band capture is one character");
    let square = captures["square"].to_string();

    if !(1..=12).contains(&month) {
        return Err(malformed(title, "sensing month outside 1-12"));
    }
    if !(1..=60).contains(&grid_zone) {
        return Err(malformed(title, "grid zone outside 1-60"));
    }

    Ok(TilePath {
        grid_zone,
        latitude_band,
        square,
        year,
        month,
    })
}

fn malformed(title: &str, reason: &str) -> FetchError {
    FetchError::MalformedTitle {
        title: title.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TITLE: &str = "S2B_MSIL2A_20250315T104619_N0511_R008_T31UDA_20250315T133000";

    #[test]
    fn decodes_tile_components() {
        let tile = resolve(TITLE).unwrap();
        assert_eq!(
            tile,
            TilePath {
                grid_zone: 31,
                latitude_band: 'U',
                square: "DA".to_string(),
                year: 2025,
                month: 3,
            }
        );
    }

    #[test]
    fn prefix_recomposes_exactly() {
        let tile = resolve(TITLE).unwrap();
        assert_eq!(tile.prefix(), "tiles/31/U/DA/2025/3");
    }

    #[test]
    fn accepts_safe_suffix() {
        let tile = resolve(&format!("{TITLE}.SAFE")).unwrap();
        assert_eq!(tile.prefix(), "tiles/31/U/DA/2025/3");
    }

    #[test]
    fn strips_leading_zero_from_zone_and_month() {
        let tile =
            resolve("S2A_MSIL2A_20240504T195901_N0510_R128_T08VPH_20240505T015750").unwrap();
        assert_eq!(tile.prefix(), "tiles/8/V/PH/2024/5");
    }

    #[test]
    fn rejects_truncated_title() {
        let err = resolve("S2B_MSIL2A_20250315T104619").unwrap_err();
        assert!(matches!(err, FetchError::MalformedTitle { .. }));
    }

    #[test]
    fn rejects_forbidden_band_letter() {
        // I and O are not valid latitude bands.
        assert!(resolve("S2B_MSIL2A_20250315T104619_N0511_R008_T31IDA_20250315T133000").is_err());
        assert!(resolve("S2B_MSIL2A_20250315T104619_N0511_R008_T31ODA_20250315T133000").is_err());
    }

    #[test]
    fn rejects_impossible_month() {
        assert!(resolve("S2B_MSIL2A_20251315T104619_N0511_R008_T31UDA_20250315T133000").is_err());
    }

    #[test]
    fn rejects_zone_zero() {
        assert!(resolve("S2B_MSIL2A_20250315T104619_N0511_R008_T00UDA_20250315T133000").is_err());
    }

    #[test]
    fn rejects_lowercase_square() {
        assert!(resolve("S2B_MSIL2A_20250315T104619_N0511_R008_T31Uda_20250315T133000").is_err());
    }
}
