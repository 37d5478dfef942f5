use std::str::FromStr;

/// An icon reference as stored in `DisplayIcon`/`ProductIcon` values:
/// `path` optionally followed by `,index`. A negative index names a
/// resource id rather than a position.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IconLocation {
    pub path: String,
    pub index: i32,
}

impl FromStr for IconLocation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        let (path, index) = match s.rsplit_once(',') {
            Some((left, right)) => match right.trim().parse::<i32>() {
                Ok(index) => (left, index),
                Err(_) => (s, 0),
            },
            None => (s, 0),
        };

        let path = path.trim().trim_matches('"').trim();
        if path.is_empty() {
            return Err("Icon reference has no path".to_string());
        }

        Ok(IconLocation { path: path.to_string(), index })
    }
}
