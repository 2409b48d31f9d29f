use std::str::FromStr;

use serde::Deserialize;

// ISUPPORT parameter references:
// - https://defs.ircdocs.horse/defs/isupport.html
// - https://modern.ircdocs.horse/#rplisupport-005

/// IRC case mappings. Nicknames and channel names compare equal ignoring
/// case; under `rfc1459` the characters `[]\~` additionally fold to `{}|^`.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum CaseMap {
    #[serde(rename = "ascii")]
    ASCII,
    #[default]
    #[serde(rename = "rfc1459")]
    RFC1459,
    #[serde(rename = "rfc1459-strict")]
    RFC1459_STRICT,
}

impl CaseMap {
    pub fn normalize(self, text: &str) -> String {
        match self {
            CaseMap::ASCII => text.to_ascii_lowercase(),
            CaseMap::RFC1459 => text
                .chars()
                .map(|c| match c {
                    '[' => '{',
                    ']' => '}',
                    '\\' => '|',
                    '~' => '^',
                    _ => c.to_ascii_lowercase(),
                })
                .collect(),
            CaseMap::RFC1459_STRICT => text
                .chars()
                .map(|c| match c {
                    '[' => '{',
                    ']' => '}',
                    '\\' => '|',
                    _ => c.to_ascii_lowercase(),
                })
                .collect(),
        }
    }
}

impl FromStr for CaseMap {
    type Err = &'static str;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_lowercase().as_ref() {
            "ascii" => Ok(CaseMap::ASCII),
            "rfc1459" => Ok(CaseMap::RFC1459),
            "rfc1459-strict" => Ok(CaseMap::RFC1459_STRICT),
            _ => Err("unknown casemapping"),
        }
    }
}

#[derive(Debug)]
pub enum Operation {
    Add(Parameter),
    Remove(String),
}

/// The subset of ISUPPORT parameters the operator service consumes.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Parameter {
    CASEMAPPING(CaseMap),
    /// Type-A channel modes, the ones that manage hostmask lists.
    CHANMODES(String),
    MODES(Option<u16>),
}

impl FromStr for Operation {
    type Err = &'static str;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        if token.is_empty() {
            return Err("empty ISUPPORT token not allowed");
        }

        match token.chars().next() {
            Some('-') => Ok(Operation::Remove(token.chars().skip(1).collect())),
            _ => {
                if let Some((parameter, value)) = token.split_once('=') {
                    match parameter {
                        "CASEMAPPING" => Ok(Operation::Add(Parameter::CASEMAPPING(
                            value.parse::<CaseMap>()?,
                        ))),
                        "CHANMODES" => {
                            // Only the first comma-separated group takes a
                            // hostmask argument; the rest are irrelevant here.
                            let list_modes = value.split(',').next().unwrap_or_default();

                            if list_modes.is_empty() {
                                Err("no list channel modes")
                            } else {
                                Ok(Operation::Add(Parameter::CHANMODES(list_modes.to_string())))
                            }
                        }
                        "MODES" => {
                            if value.is_empty() {
                                Ok(Operation::Add(Parameter::MODES(None)))
                            } else if let Ok(value) = value.parse::<u16>() {
                                Ok(Operation::Add(Parameter::MODES(Some(value))))
                            } else {
                                Err("value must be a positive integer if specified")
                            }
                        }
                        _ => Err("unused ISUPPORT parameter"),
                    }
                } else {
                    match token {
                        "CASEMAPPING" => Err("value required"),
                        "CHANMODES" => Err("value(s) required"),
                        "MODES" => Ok(Operation::Add(Parameter::MODES(None))),
                        _ => Err("unused ISUPPORT parameter"),
                    }
                }
            }
        }
    }
}

/// Per-server capabilities learned from RPL_ISUPPORT advertisements.
#[derive(Clone, Debug, Default)]
pub struct ServerParams {
    pub casemap: Option<CaseMap>,
    pub list_modes: Option<String>,
    pub max_modes: Option<u16>,
}

impl ServerParams {
    pub fn apply(&mut self, operation: Operation) {
        match operation {
            Operation::Add(Parameter::CASEMAPPING(casemap)) => self.casemap = Some(casemap),
            Operation::Add(Parameter::CHANMODES(list_modes)) => {
                self.list_modes = Some(list_modes);
            }
            Operation::Add(Parameter::MODES(max_modes)) => self.max_modes = max_modes,
            Operation::Remove(parameter) => match parameter.as_ref() {
                "CASEMAPPING" => self.casemap = None,
                "CHANMODES" => self.list_modes = None,
                "MODES" => self.max_modes = None,
                _ => (),
            },
        }
    }
}
