//! Static code tables for markets, cooperatives, varieties and grades.

/// Market-code prefix (`<letter>0`) to market name.
pub const MARKETS: &[(&str, &str)] = &[
    ("A0", "台北市"),
    ("B0", "台中市"),
    ("D0", "台南市"),
    ("E0", "高雄市"),
    ("F0", "新北市"),
    ("G0", "宜蘭縣"),
    ("H0", "桃園市"),
    ("K0", "苗栗縣"),
    ("M0", "南投縣"),
    ("N0", "彰化縣"),
    ("P0", "雲林縣"),
    ("Q0", "嘉義縣"),
    ("S0", "高雄縣"),
    ("T0", "屏東縣"),
    ("U0", "花蓮縣"),
    ("V0", "台東縣"),
];

/// Supply number to cooperative (farmers' association) name.
pub const COOPERATIVES: &[(&str, &str)] = &[
    ("A00013", "台北市農會"),
    ("E00021", "大樹區農會"),
    ("M00008", "集集鎮農會"),
    ("N00034", "溪湖鎮農會"),
    ("P00011", "西螺鎮農會"),
    ("Q00017", "中埔鄉農會"),
    ("S00076", "燕巢區農會"),
    ("T00021", "高樹鄉農會"),
    ("T00045", "枋山鄉農會"),
];

/// Produce code to produce name.
pub const VARIETIES: &[(&str, &str)] = &[
    ("A1", "香蕉"),
    ("B2", "鳳梨-金鑽"),
    ("I1", "木瓜"),
    ("J1", "荔枝-玉荷包"),
    ("J2", "荔枝-黑葉"),
    ("P1", "番石榴-珍珠"),
    ("R1", "芒果-愛文"),
    ("R2", "芒果-金煌"),
    ("T1", "蓮霧"),
    ("LA1", "甘藍-初秋"),
    ("FN1", "絲瓜"),
];

pub const GRADES: &[(&str, &str)] = &[("1", "特"), ("2", "優"), ("3", "良")];

fn lookup(table: &'static [(&'static str, &'static str)], code: &str) -> Option<&'static str> {
    table
        .iter()
        .find(|(candidate, _)| *candidate == code)
        .map(|(_, name)| *name)
}

pub fn market_name(prefix: &str) -> Option<&'static str> {
    lookup(MARKETS, prefix)
}

pub fn cooperative_name(code: &str) -> Option<&'static str> {
    lookup(COOPERATIVES, code)
}

pub fn variety_name(code: &str) -> Option<&'static str> {
    lookup(VARIETIES, code)
}

pub fn grade_name(code: &str) -> Option<&'static str> {
    lookup(GRADES, code)
}

pub fn is_known_variety(code: &str) -> bool {
    variety_name(code).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn market_prefixes_are_two_characters_and_unique() {
        for (i, (code, _)) in MARKETS.iter().enumerate() {
            assert_eq!(code.len(), 2, "{code}");
            assert!(MARKETS[i + 1..].iter().all(|(other, _)| other != code));
        }
    }

    #[test]
    fn cooperative_codes_follow_supply_number_shape() {
        for (code, _) in COOPERATIVES {
            let bytes = code.as_bytes();
            assert_eq!(bytes.len(), 6, "{code}");
            assert!(bytes[0].is_ascii_uppercase());
            assert_eq!(&code[1..3], "00");
            assert!(bytes[3..].iter().all(u8::is_ascii_digit));
        }
    }

    #[test]
    fn lookups_resolve_known_codes_only() {
        assert_eq!(market_name("S0"), Some("高雄縣"));
        assert_eq!(market_name("Z0"), None);
        assert_eq!(cooperative_name("A00013"), Some("台北市農會"));
        assert!(is_known_variety("LA1"));
        assert!(!is_known_variety("LA"));
    }
}
