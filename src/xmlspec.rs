//! Parser for Slicer execution-model XML.
//!
//! A CLI describes itself with a document like:
//!
//! ```xml
//! <executable>
//!   <title>Nuclei Detection</title>
//!   <parameters>
//!     <label>IO</label>
//!     <image><name>inputImageFile</name><channel>input</channel></image>
//!   </parameters>
//! </executable>
//! ```
//!
//! Each child of a `<parameters>` block other than `label`/`description`
//! is one parameter whose tag names its Slicer type. The widget [`Kind`]
//! is derived from that tag and the parameter's channel.

use log::warn;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Serialize;

/// Widget type used by clients to render a parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    Number,
    Boolean,
    String,
    NumberVector,
    StringVector,
    NumberEnumeration,
    StringEnumeration,
    File,
    Image,
    Directory,
    NewFile,
}

impl Kind {
    fn from_tag(tag: &str) -> Option<Kind> {
        let kind = match tag {
            "integer" | "float" | "double" => Kind::Number,
            "boolean" => Kind::Boolean,
            "string" => Kind::String,
            "integer-vector" | "float-vector" | "double-vector" => Kind::NumberVector,
            "string-vector" => Kind::StringVector,
            "integer-enumeration" | "float-enumeration" | "double-enumeration" => {
                Kind::NumberEnumeration
            }
            "string-enumeration" => Kind::StringEnumeration,
            "file" => Kind::File,
            "image" => Kind::Image,
            "directory" => Kind::Directory,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Constraints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Parameter {
    /// Tag name in the XML, e.g. `integer-enumeration`.
    pub slicer_type: String,
    /// `None` for tags no widget handles.
    #[serde(rename = "type")]
    pub kind: Option<Kind>,
    /// `name`, falling back to `longflag`.
    pub id: String,
    pub title: String,
    pub description: String,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longflag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParameterGroup {
    pub label: String,
    pub description: String,
    pub advanced: bool,
    pub parameters: Vec<Parameter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CliSpec {
    pub title: String,
    pub description: String,
    pub version: String,
    pub category: String,
    pub groups: Vec<ParameterGroup>,
}

impl CliSpec {
    pub fn parameters(&self) -> impl Iterator<Item = &Parameter> {
        self.groups.iter().flat_map(|g| g.parameters.iter())
    }
}

/// Parse a Slicer XML document. The root element must be `executable`.
pub fn parse(xml: &str) -> Result<CliSpec, String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut spec = CliSpec::default();
    let mut path: Vec<String> = Vec::new();
    let mut group: Option<ParameterGroup> = None;
    let mut param: Option<Parameter> = None;
    let mut saw_root = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {}", reader.buffer_position(), e))?;
        match event {
            Event::Start(e) => {
                let name = tag_name(&e);
                open(&name, &e, &path, &mut group, &mut param, &mut saw_root)?;
                path.push(name);
            }
            Event::Empty(e) => {
                let name = tag_name(&e);
                open(&name, &e, &path, &mut group, &mut param, &mut saw_root)?;
                close(&name, &path, &mut spec, &mut group, &mut param);
            }
            Event::End(_) => {
                if let Some(name) = path.pop() {
                    close(&name, &path, &mut spec, &mut group, &mut param);
                }
            }
            Event::Text(t) => {
                let text = t.unescape().map_err(|e| e.to_string())?;
                assign(&path, text.trim(), &mut spec, &mut group, &mut param);
            }
            Event::CData(c) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                assign(&path, text.trim(), &mut spec, &mut group, &mut param);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_root {
        return Err("missing <executable> root element".to_string());
    }
    if !path.is_empty() {
        return Err(format!("unclosed element <{}>", path.join("/")));
    }
    Ok(spec)
}

fn tag_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.name().as_ref()).into_owned()
}

fn open(
    name: &str,
    e: &BytesStart<'_>,
    path: &[String],
    group: &mut Option<ParameterGroup>,
    param: &mut Option<Parameter>,
    saw_root: &mut bool,
) -> Result<(), String> {
    match path.len() {
        0 if name == "executable" => *saw_root = true,
        0 => return Err(format!("unexpected root element <{}>", name)),
        1 if name == "parameters" => {
            let advanced = e
                .try_get_attribute("advanced")
                .ok()
                .flatten()
                .map(|a| a.value.as_ref() == b"true")
                .unwrap_or(false);
            *group = Some(ParameterGroup {
                advanced,
                ..Default::default()
            });
        }
        2 if path[1] == "parameters" && name != "label" && name != "description" => {
            let kind = Kind::from_tag(name);
            if kind.is_none() {
                warn!("Unhandled parameter type \"{}\"", name);
            }
            *param = Some(Parameter {
                slicer_type: name.to_string(),
                kind,
                channel: "input".to_string(),
                ..Default::default()
            });
        }
        _ => {}
    }
    Ok(())
}

fn close(
    name: &str,
    path: &[String],
    spec: &mut CliSpec,
    group: &mut Option<ParameterGroup>,
    param: &mut Option<Parameter>,
) {
    match path.len() {
        1 if name == "parameters" => {
            if let Some(g) = group.take() {
                spec.groups.push(g);
            }
        }
        2 if path[1] == "parameters" => {
            if let Some(mut p) = param.take() {
                if p.id.is_empty() {
                    p.id = p.longflag.clone().unwrap_or_default();
                }
                if matches!(p.kind, Some(Kind::File) | Some(Kind::Image)) && p.channel == "output" {
                    p.kind = Some(Kind::NewFile);
                }
                if let Some(g) = group.as_mut() {
                    g.parameters.push(p);
                }
            }
        }
        _ => {}
    }
}

fn assign(
    path: &[String],
    text: &str,
    spec: &mut CliSpec,
    group: &mut Option<ParameterGroup>,
    param: &mut Option<Parameter>,
) {
    if text.is_empty() {
        return;
    }
    let names: Vec<&str> = path.iter().map(String::as_str).collect();
    match names.as_slice() {
        ["executable", field] => match *field {
            "title" => spec.title = text.to_string(),
            "description" => spec.description = text.to_string(),
            "version" => spec.version = text.to_string(),
            "category" => spec.category = text.to_string(),
            _ => {}
        },
        ["executable", "parameters", field] => {
            if let Some(g) = group.as_mut() {
                match *field {
                    "label" => g.label = text.to_string(),
                    "description" => g.description = text.to_string(),
                    _ => {}
                }
            }
        }
        ["executable", "parameters", _, field] => {
            let Some(p) = param.as_mut() else { return };
            match *field {
                "name" => p.id = text.to_string(),
                "label" => p.title = text.to_string(),
                "description" => p.description = text.to_string(),
                "channel" => p.channel = text.to_string(),
                "default" => p.default = Some(text.to_string()),
                "element" => p.values.push(text.to_string()),
                "index" => p.index = text.parse().ok(),
                "flag" => p.flag = Some(text.to_string()),
                "longflag" => p.longflag = Some(text.to_string()),
                _ => {}
            }
        }
        ["executable", "parameters", _, "constraints", field] => {
            let Some(p) = param.as_mut() else { return };
            let c = p.constraints.get_or_insert_with(Constraints::default);
            match *field {
                "minimum" => c.minimum = Some(text.to_string()),
                "maximum" => c.maximum = Some(text.to_string()),
                "step" => c.step = Some(text.to_string()),
                _ => {}
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<executable>
  <category>HistomicsTK</category>
  <title>Color Deconvolution</title>
  <description>Separates stains &amp; counterstains</description>
  <version>0.1.0</version>
  <parameters>
    <label>IO</label>
    <description>Input/output parameters</description>
    <image>
      <name>inputImageFile</name>
      <label>Input Image</label>
      <index>0</index>
      <description>Input image</description>
    </image>
    <image>
      <name>outputStainImageFile</name>
      <label>Output Stain</label>
      <channel>output</channel>
      <index>1</index>
    </image>
  </parameters>
  <parameters advanced="true">
    <label>Tuning</label>
    <string-enumeration>
      <longflag>stain</longflag>
      <label>Stain</label>
      <element>hematoxylin</element>
      <element>eosin</element>
      <default>hematoxylin</default>
    </string-enumeration>
    <double>
      <name>sigma</name>
      <constraints><minimum>0</minimum><maximum>10</maximum><step>0.5</step></constraints>
      <default>2.0</default>
    </double>
    <region><name>roi</name></region>
  </parameters>
</executable>"#;

    #[test]
    fn parses_groups_and_parameters() {
        let spec = parse(SPEC).unwrap();
        assert_eq!(spec.title, "Color Deconvolution");
        assert_eq!(spec.description, "Separates stains & counterstains");
        assert_eq!(spec.category, "HistomicsTK");
        assert_eq!(spec.groups.len(), 2);
        assert_eq!(spec.groups[0].label, "IO");
        assert!(!spec.groups[0].advanced);
        assert!(spec.groups[1].advanced);
        assert_eq!(spec.parameters().count(), 5);

        let input = &spec.groups[0].parameters[0];
        assert_eq!(input.id, "inputImageFile");
        assert_eq!(input.kind, Some(Kind::Image));
        assert_eq!(input.channel, "input");
        assert_eq!(input.index, Some(0));
    }

    #[test]
    fn output_images_become_new_files() {
        let spec = parse(SPEC).unwrap();
        let output = &spec.groups[0].parameters[1];
        assert_eq!(output.channel, "output");
        assert_eq!(output.kind, Some(Kind::NewFile));
    }

    #[test]
    fn enumerations_and_constraints() {
        let spec = parse(SPEC).unwrap();
        let stain = &spec.groups[1].parameters[0];
        assert_eq!(stain.id, "stain", "id falls back to longflag");
        assert_eq!(stain.kind, Some(Kind::StringEnumeration));
        assert_eq!(stain.values, vec!["hematoxylin", "eosin"]);
        assert_eq!(stain.default.as_deref(), Some("hematoxylin"));

        let sigma = &spec.groups[1].parameters[1];
        assert_eq!(sigma.kind, Some(Kind::Number));
        let c = sigma.constraints.as_ref().unwrap();
        assert_eq!(c.minimum.as_deref(), Some("0"));
        assert_eq!(c.maximum.as_deref(), Some("10"));
        assert_eq!(c.step.as_deref(), Some("0.5"));
    }

    #[test]
    fn unknown_tags_have_no_kind() {
        let spec = parse(SPEC).unwrap();
        let roi = &spec.groups[1].parameters[2];
        assert_eq!(roi.slicer_type, "region");
        assert_eq!(roi.kind, None);
    }

    #[test]
    fn rejects_wrong_root_and_garbage() {
        assert!(parse("<html><body/></html>").is_err());
        assert!(parse("Hello from Docker!").is_err());
        assert!(parse("").is_err());
        assert!(parse("<executable><title>x</title>").is_err());
    }
}
