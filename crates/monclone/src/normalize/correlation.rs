//! Correlation and regular-expression processors.

use super::{Normalizer, Outcome};
use crate::error::NormalizeError;
use crate::kind::EntityKind;
use crate::snapshot::Record;
use crate::value::{as_str_like, int_field};
use serde_json::Value;

/// Correlations reference host groups in their filter conditions; a
/// record whose conditions all fail to resolve is dropped rather than
/// created as a match-nothing rule.
pub fn process(n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        let data = record.payload.as_object_mut().ok_or_else(|| {
            NormalizeError::new(EntityKind::Correlation, "record is not an object")
        })?;
        let Some(filter) = data.get_mut("filter").and_then(Value::as_object_mut) else {
            continue;
        };

        filter.remove("eval_formula");
        let custom_formula = int_field(filter, "evaltype", 0) == 3;
        if !custom_formula {
            filter.remove("formula");
        }

        let id_field = n.profile.id_field(EntityKind::HostGroup).unwrap_or("groupid");
        let mut surviving = Vec::new();
        if let Some(Value::Array(conditions)) = filter.get_mut("conditions") {
            for mut condition in conditions.drain(..) {
                let Some(map) = condition.as_object_mut() else {
                    continue;
                };
                if !custom_formula {
                    map.remove("formulaid");
                }
                // Type 2 conditions carry a host-group reference.
                if int_field(map, "type", -1) == 2 {
                    let Some(target) = map.get(id_field).and_then(as_str_like) else {
                        continue;
                    };
                    match n.translate(EntityKind::HostGroup, &target) {
                        Some(translated) => {
                            map.insert(id_field.to_string(), Value::String(translated));
                        }
                        None => continue,
                    }
                }
                surviving.push(condition);
            }
        }
        if surviving.is_empty() {
            continue;
        }
        filter.insert("conditions".to_string(), Value::Array(surviving));

        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

/// Regular expressions: the delimiter field is only legal on "result is
/// TRUE" expressions; the API rejects it anywhere else.
pub fn process_regexp(_n: &Normalizer<'_>, records: Vec<Record>) -> Result<Outcome, NormalizeError> {
    let mut kept = Vec::new();
    for mut record in records {
        let data = record
            .payload
            .as_object_mut()
            .ok_or_else(|| NormalizeError::new(EntityKind::Regexp, "record is not an object"))?;
        if let Some(Value::Array(expressions)) = data.get_mut("expressions") {
            for expression in expressions.iter_mut() {
                let Some(map) = expression.as_object_mut() else {
                    continue;
                };
                if int_field(map, "expression_type", 0) != 1 {
                    map.remove("exp_delimiter");
                }
            }
        }
        kept.push(record);
    }
    Ok(Outcome::records(kept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::testutil::Fixture;
    use crate::normalize::Direction;
    use crate::release::Release;
    use serde_json::json;

    #[test]
    fn group_conditions_translate_and_orphans_drop_the_record() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.seed(EntityKind::HostGroup, &[("5", "Linux servers")]);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![
                Record::new(
                    EntityKind::Correlation,
                    "dedupe",
                    json!({"filter": {
                        "evaltype": "0",
                        "eval_formula": "A",
                        "conditions": [
                            {"type": "2", "groupid": "Linux servers", "formulaid": "A"},
                            {"type": "0", "tag": "env"},
                        ],
                    }}),
                ),
                Record::new(
                    EntityKind::Correlation,
                    "orphan",
                    json!({"filter": {
                        "evaltype": "0",
                        "conditions": [{"type": "2", "groupid": "Gone group"}],
                    }}),
                ),
            ],
        )
        .unwrap();
        assert_eq!(outcome.records.len(), 1);
        let filter = &outcome.records[0].payload["filter"];
        assert!(filter.get("eval_formula").is_none());
        let conditions = filter["conditions"].as_array().unwrap();
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0]["groupid"], json!("5"));
        assert!(conditions[0].get("formulaid").is_none());
    }

    #[test]
    fn custom_formula_keeps_formula_ids() {
        let mut fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        fixture.seed(EntityKind::HostGroup, &[("5", "Linux servers")]);
        let n = fixture.normalizer();
        let outcome = process(
            &n,
            vec![Record::new(
                EntityKind::Correlation,
                "custom",
                json!({"filter": {
                    "evaltype": "3",
                    "formula": "A and B",
                    "conditions": [{"type": "0", "tag": "env", "formulaid": "A"}],
                }}),
            )],
        )
        .unwrap();
        let filter = &outcome.records[0].payload["filter"];
        assert_eq!(filter["formula"], json!("A and B"));
        assert_eq!(filter["conditions"][0]["formulaid"], json!("A"));
    }

    #[test]
    fn delimiter_survives_only_on_true_expressions() {
        let fixture = Fixture::new(Release::R6_4, Release::R6_4, Direction::Worker);
        let n = fixture.normalizer();
        let outcome = process_regexp(
            &n,
            vec![Record::new(
                EntityKind::Regexp,
                "file systems",
                json!({"expressions": [
                    {"expression_type": "1", "exp_delimiter": ",", "expression": "a"},
                    {"expression_type": "3", "exp_delimiter": ",", "expression": "b"},
                ]}),
            )],
        )
        .unwrap();
        let expressions = outcome.records[0].payload["expressions"].as_array().unwrap();
        assert_eq!(expressions[0]["exp_delimiter"], json!(","));
        assert!(expressions[1].get("exp_delimiter").is_none());
    }
}
