use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TemplatePart {
    Text(String),
    /// `${CUBE}`: the owning cube's alias.
    SelfAlias,
    /// `${Users}`: another cube's alias, used in join conditions.
    CubeAlias(String),
    /// `${status}`, `${CUBE.status}` or `${Users.name}`.
    Member { cube: Option<String>, member: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SqlTemplate {
    pub parts: Vec<TemplatePart>,
}

impl SqlTemplate {
    /// Parse `src`; `is_cube` tells a bare `${Name}` cube alias apart from a
    /// bare member of the owning cube.
    pub fn parse(src: &str, is_cube: impl Fn(&str) -> bool) -> Result<Self, String> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut rest = src;

        while let Some(pos) = rest.find('{') {
            let dollar = pos > 0 && rest.as_bytes()[pos - 1] == b'$';
            let Some(close) = rest[pos..].find('}') else {
                if dollar {
                    return Err(format!("unterminated reference in '{src}'"));
                }
                break;
            };
            let inner = rest[pos + 1..pos + close].trim();
            // Bare braces are only references when they name CUBE; anything
            // else (JSON literals, regex quantifiers) is plain SQL.
            if !dollar && !(inner == "CUBE" || inner.starts_with("CUBE.")) {
                text.push_str(&rest[..pos + close + 1]);
                rest = &rest[pos + close + 1..];
                continue;
            }
            let prefix_end = if dollar { pos - 1 } else { pos };
            text.push_str(&rest[..prefix_end]);
            if !text.is_empty() {
                parts.push(TemplatePart::Text(std::mem::take(&mut text)));
            }
            parts.push(classify(inner, &is_cube, src)?);
            rest = &rest[pos + close + 1..];
        }
        text.push_str(rest);
        if !text.is_empty() {
            parts.push(TemplatePart::Text(text));
        }
        Ok(Self { parts })
    }

    /// Template without holes.
    pub fn literal(sql: &str) -> Self {
        Self {
            parts: vec![TemplatePart::Text(sql.to_string())],
        }
    }

    /// Member references in order of appearance.
    pub fn member_refs(&self) -> impl Iterator<Item = (Option<&str>, &str)> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Member { cube, member } => Some((cube.as_deref(), member.as_str())),
            _ => None,
        })
    }

    pub fn cube_refs(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::CubeAlias(c) => Some(c.as_str()),
            TemplatePart::Member { cube: Some(c), .. } => Some(c.as_str()),
            _ => None,
        })
    }
}

fn classify(inner: &str, is_cube: &impl Fn(&str) -> bool, src: &str) -> Result<TemplatePart, String> {
    if inner.is_empty() {
        return Err(format!("empty reference in '{src}'"));
    }
    let segments: Vec<&str> = inner.split('.').map(str::trim).collect();
    if segments.iter().any(|s| !is_identifier(s)) {
        return Err(format!("invalid reference '{inner}' in '{src}'"));
    }
    match segments.as_slice() {
        ["CUBE"] => Ok(TemplatePart::SelfAlias),
        [name] if is_cube(name) => Ok(TemplatePart::CubeAlias((*name).to_string())),
        [member] => Ok(TemplatePart::Member {
            cube: None,
            member: (*member).to_string(),
        }),
        ["CUBE", member] => Ok(TemplatePart::Member {
            cube: None,
            member: (*member).to_string(),
        }),
        [cube, member] => Ok(TemplatePart::Member {
            cube: Some((*cube).to_string()),
            member: (*member).to_string(),
        }),
        _ => Err(format!(
            "reference '{inner}' in '{src}' has too many segments; use Cube.member"
        )),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
