//! Service Control Protocol Description parsing.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Scpd {
    #[serde(rename = "actionList")]
    pub action_list: ActionList,
    #[serde(rename = "serviceStateTable")]
    pub service_state_table: ServiceStateTable,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ActionList {
    #[serde(rename = "action", default)]
    pub action: OneOrMany<Action>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Action {
    pub name: String,
    #[serde(rename = "argumentList", default)]
    pub argument_list: Option<ArgumentList>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArgumentList {
    #[serde(rename = "argument", default)]
    pub argument: OneOrMany<Argument>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Argument {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceStateTable {
    #[serde(rename = "stateVariable", default)]
    pub state_variable: OneOrMany<StateVariable>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateVariable {
    pub name: String,
    #[serde(rename = "allowedValueRange", default)]
    pub allowed_value_range: Option<AllowedValueRange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AllowedValueRange {
    pub minimum: i32,
    pub maximum: i32,
    #[serde(default = "default_step")]
    pub step: i32,
}

fn default_step() -> i32 {
    1
}

/// SCPD element lists can serialize as a bare element (one item) or a
/// sequence; this normalizes both to a `Vec`.
#[derive(Debug, Clone, Default)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<'de, T: Deserialize<'de>> Deserialize<'de> for OneOrMany<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<T> {
            One(T),
            Many(Vec<T>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::One(v) => OneOrMany(vec![v]),
            Repr::Many(v) => OneOrMany(v),
        })
    }
}

impl Scpd {
    pub fn action(&self, name: &str) -> Option<&Action> {
        self.action_list.action.0.iter().find(|a| a.name == name)
    }

    /// Volume `allowedValueRange`, defaulting to `(0, 100, 1)` if the
    /// `Volume` state variable is absent or lacks a range (as in the
    /// original's best-effort `get_volume_info`).
    pub fn volume_range(&self) -> (i32, i32, i32) {
        self.service_state_table
            .state_variable
            .0
            .iter()
            .find(|v| v.name == "Volume")
            .and_then(|v| v.allowed_value_range.as_ref())
            .map(|r| (r.minimum, r.maximum, r.step))
            .unwrap_or((0, 100, 1))
    }
}

/// Strips the first bare `xmlns="..."` occurrence, matching the original's
/// `re.sub(' xmlns="[^"]+"', '', xml, count=1)` namespace-stripping so a
/// plain `quick_xml` deserialize doesn't need namespace awareness.
pub fn strip_default_namespace(xml: &str) -> String {
    if let Some(start) = xml.find(" xmlns=\"") {
        if let Some(rel_end) = xml[start + 8..].find('"') {
            let end = start + 8 + rel_end + 1;
            let mut out = String::with_capacity(xml.len());
            out.push_str(&xml[..start]);
            out.push_str(&xml[end..]);
            return out;
        }
    }
    xml.to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<scpd>
  <actionList>
    <action>
      <name>SetVolume</name>
      <argumentList>
        <argument><name>InstanceID</name></argument>
        <argument><name>Channel</name></argument>
        <argument><name>DesiredVolume</name></argument>
      </argumentList>
    </action>
    <action>
      <name>Play</name>
      <argumentList>
        <argument><name>InstanceID</name></argument>
        <argument><name>Speed</name></argument>
      </argumentList>
    </action>
  </actionList>
  <serviceStateTable>
    <stateVariable>
      <name>Volume</name>
      <allowedValueRange>
        <minimum>0</minimum>
        <maximum>65535</maximum>
        <step>256</step>
      </allowedValueRange>
    </stateVariable>
  </serviceStateTable>
</scpd>"#;

    #[test]
    fn parses_actions_and_volume_range() {
        let scpd: Scpd = quick_xml::de::from_str(SAMPLE).unwrap();
        assert!(scpd.action("SetVolume").is_some());
        assert!(scpd.action("Missing").is_none());
        assert_eq!(scpd.volume_range(), (0, 65535, 256));
    }

    #[test]
    fn strips_single_default_namespace() {
        let xml = r#"<root xmlns="urn:schemas-upnp-org:device-1-0"><device/></root>"#;
        assert_eq!(strip_default_namespace(xml), "<root><device/></root>");
    }
}
