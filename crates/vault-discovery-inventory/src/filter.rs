use crate::InstanceRecord;

/// Instance filters. Every configured axis must match; an unset axis does not
/// filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Network tag, case-insensitive equality.
    pub tag: Option<String>,
    /// Label value, or `key=value`, case-insensitive equality.
    pub label: Option<String>,
    /// Substring of the instance name.
    pub name: Option<String>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &InstanceRecord) -> bool {
        self.matches_tag(instance) && self.matches_label(instance) && self.matches_name(instance)
    }

    fn matches_tag(&self, instance: &InstanceRecord) -> bool {
        match &self.tag {
            Some(tag) => instance.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)),
            None => true,
        }
    }

    fn matches_label(&self, instance: &InstanceRecord) -> bool {
        let Some(label) = &self.label else {
            return true;
        };

        match label.split_once('=') {
            Some((key, value)) => instance
                .labels
                .iter()
                .any(|(k, v)| k.eq_ignore_ascii_case(key) && v.eq_ignore_ascii_case(value)),
            None => instance
                .labels
                .values()
                .any(|v| v.eq_ignore_ascii_case(label)),
        }
    }

    fn matches_name(&self, instance: &InstanceRecord) -> bool {
        match &self.name {
            Some(name) => instance.name.contains(name.as_str()),
            None => true,
        }
    }
}
