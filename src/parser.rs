use std::sync::OnceLock;

use anyhow::{bail, Error};
use pest::{iterators::Pair, Parser};
use pest_derive::Parser;
use regex::Regex;

use crate::escape::fold_line;

fn strip_folds(s: &str) -> String {
    static FOLD: OnceLock<Regex> = OnceLock::new();
    let re = FOLD.get_or_init(|| Regex::new(r"\r?\n[\t ]").expect("valid fold regex"));

    re.replace_all(s, "").into_owned()
}

#[derive(Parser)]
#[grammar = "grammar.pest"]
struct CalParser;

#[derive(Debug, Clone, PartialEq)]
pub struct Component {
    pub name: String,
    pub sub_components: Vec<Component>,
    pub properties: Vec<Property>,
}

impl Component {
    pub fn new(name: impl Into<String>) -> Component {
        Component {
            name: name.into(),
            sub_components: Vec::new(),
            properties: Vec::new(),
        }
    }

    /// Parse all top level components in the given data.
    pub fn from_str_to_stream(data: &str) -> Result<Vec<Component>, Error> {
        let data = data.trim_start_matches('\u{feff}');
        let pairs = CalParser::parse(Rule::stream, data)?;

        pairs
            .filter(|pair| pair.as_rule() == Rule::component)
            .map(Component::from_pair)
            .collect()
    }

    fn from_pair(pair: Pair<Rule>) -> Result<Component, Error> {
        let span = pair.as_span();
        let mut name = None;
        let mut sub_components = Vec::new();
        let mut properties = Vec::new();

        for inner_pair in pair.into_inner() {
            match inner_pair.as_rule() {
                Rule::name => name = Some(strip_folds(inner_pair.as_str())),
                Rule::component => sub_components.push(Component::from_pair(inner_pair)?),
                Rule::property => properties.push(Property::from_pair(inner_pair)?),
                _ => bail!("Unexpected type {:?}", inner_pair.as_rule()),
            }
        }

        if let Some(name) = name {
            Ok(Component {
                name,
                sub_components,
                properties,
            })
        } else {
            bail!("No name for component: {:?}", span.as_str());
        }
    }

    pub fn push(&mut self, property: Property) {
        self.properties.push(property);
    }

    /// The first property with the given name, if any.
    pub fn property(&self, name: &str) -> Option<&Property> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    fn content_lines(&self, lines: &mut Vec<String>) {
        lines.push(format!("BEGIN:{}", self.name));
        lines.extend(self.properties.iter().map(Property::as_string));
        for sub_component in &self.sub_components {
            sub_component.content_lines(lines);
        }
        lines.push(format!("END:{}", self.name));
    }

    /// Serialize the component, folding long lines and terminating every
    /// line with CRLF.
    pub fn as_string(&self) -> String {
        let mut lines = Vec::new();
        self.content_lines(&mut lines);

        let mut out = String::new();
        for line in lines {
            out.push_str(&fold_line(&line));
            out.push_str("\r\n");
        }

        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    pub name: String,
    pub value: String,
    pub parameters: Vec<Parameter>,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Property {
        Property {
            name: name.into(),
            value: value.into(),
            parameters: Vec::new(),
        }
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Property {
        self.parameters.push(Parameter {
            name: name.into(),
            values: vec![value.into()],
        });
        self
    }

    /// The first value of the named parameter, if present.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .and_then(|p| p.values.first())
            .map(String::as_str)
    }

    fn from_pair(pair: Pair<Rule>) -> Result<Property, Error> {
        let span = pair.as_span();
        let mut name = None;
        let mut value = None;
        let mut parameters = Vec::new();

        for inner_pair in pair.into_inner() {
            match inner_pair.as_rule() {
                Rule::name => name = Some(strip_folds(inner_pair.as_str())),
                Rule::property_value => value = Some(strip_folds(inner_pair.as_str())),
                Rule::param => parameters.push(Parameter::from_pair(inner_pair)?),
                _ => bail!("Unexpected type {:?}", inner_pair.as_rule()),
            }
        }

        if let (Some(name), Some(value)) = (name, value) {
            Ok(Property {
                name,
                value,
                parameters,
            })
        } else {
            bail!("No name for property: {:?}", span.as_str());
        }
    }

    pub fn as_string(&self) -> String {
        if self.parameters.is_empty() {
            format!("{}:{}", self.name, self.value)
        } else {
            let params = self
                .parameters
                .iter()
                .map(|v| v.as_string())
                .collect::<Vec<_>>()
                .join(";");

            format!("{};{}:{}", self.name, params, self.value)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub values: Vec<String>,
}

impl Parameter {
    fn from_pair(pair: Pair<Rule>) -> Result<Parameter, Error> {
        let span = pair.as_span();
        let mut name = None;
        let mut values = Vec::new();
        for inner_pair in pair.into_inner() {
            match inner_pair.as_rule() {
                Rule::name => name = Some(strip_folds(inner_pair.as_str())),
                Rule::param_value => {
                    values.push(strip_folds(inner_pair.as_str().trim_matches('"')))
                }
                _ => bail!("Unexpected type {:?}", inner_pair.as_rule()),
            }
        }

        if values.is_empty() {
            bail!("No values for param {:?}", span.as_str());
        }

        if let Some(name) = name {
            Ok(Parameter { name, values })
        } else {
            bail!("No name for parameter: {:?}", span.as_str());
        }
    }

    pub fn as_string(&self) -> String {
        // Values are comma separated, so anything containing a delimiter has
        // to be quoted.
        let values = self
            .values
            .iter()
            .map(|v| {
                if v.is_empty() || v.contains(&[':', ';', ','] as &[_]) {
                    format!(r#""{}""#, v)
                } else {
                    v.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(",");

        format!("{}={}", self.name, values)
    }
}
