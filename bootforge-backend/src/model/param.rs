// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Parameter definitions: a name plus a schema that candidate values are
//! checked against.

use std::any::Any;

use bootforge_common::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::index::{check_unique, Maker};
use crate::model::{Entity, PARAMS};
use crate::tracker::{DataTracker, Stores};

const KNOWN_TYPES: &[&str] =
    &["string", "boolean", "integer", "number", "array", "object"];

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Param {
    pub name: String,
    pub description: String,
    /// A JSON document constraining values for this parameter.  Only the
    /// `type` keyword is enforced; an empty schema accepts anything.
    pub schema: Value,
}

impl Param {
    pub fn new(name: &str, schema: Value) -> Param {
        Param { name: name.to_string(), schema, ..Default::default() }
    }

    fn schema_type(&self) -> Option<&str> {
        self.schema.get("type").and_then(Value::as_str)
    }

    /// Checks a candidate value against this parameter's schema.
    pub fn validate_value(&self, val: &Value) -> Result<(), Error> {
        let Some(want) = self.schema_type() else {
            return Ok(());
        };
        let ok = match want {
            "string" => val.is_string(),
            "boolean" => val.is_boolean(),
            "integer" => val.is_i64() || val.is_u64(),
            "number" => val.is_number(),
            "array" => val.is_array(),
            "object" => val.is_object(),
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            let mut e = Error::validation(PARAMS, &self.name);
            e.add(format!("Value {} is not a {}", val, want));
            Err(e)
        }
    }
}

pub fn as_param(e: &dyn Entity) -> &Param {
    e.as_any().downcast_ref::<Param>().expect("params entry was not a Param")
}

impl Entity for Param {
    fn prefix(&self) -> &'static str {
        PARAMS
    }

    fn key(&self) -> String {
        self.name.clone()
    }

    fn indexes(&self) -> Vec<(&'static str, Maker)> {
        vec![
            ("Key", Maker::key()),
            (
                "Name",
                Maker::new(
                    true,
                    "string",
                    |i, j| as_param(i).name < as_param(j).name,
                    |r| {
                        let gte = as_param(r).name.clone();
                        let gt = gte.clone();
                        (
                            Box::new(move |s| as_param(s).name >= gte),
                            Box::new(move |s| as_param(s).name > gt),
                        )
                    },
                    |s| Ok(Box::new(Param::new(s, Value::Null)) as Box<dyn Entity>),
                ),
            ),
        ]
    }

    fn marshal(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self)
            .map_err(|e| Error::backend(format!("encode param {}: {}", self.name, e)))
    }

    fn clone_entity(&self) -> Box<dyn Entity> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn validate(
        &mut self,
        _dt: &DataTracker,
        d: &mut Stores<'_>,
    ) -> Result<(), Error> {
        let mut e = Error::validation(PARAMS, &self.name);
        if self.name.is_empty() {
            e.add("Param must have a name");
        }
        if let Some(t) = self.schema_type() {
            if !KNOWN_TYPES.contains(&t) {
                e.add(format!("Unknown schema type {:?}", t));
            }
        }
        if let Err(dup) = check_unique(self, &d.get(PARAMS).items()) {
            e.merge(dup);
        }
        e.or_ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_validate_value() {
        let p = Param::new("ntp-servers", json!({"type": "array"}));
        p.validate_value(&json!(["10.0.0.1"])).unwrap();
        let err = p.validate_value(&json!("10.0.0.1")).unwrap_err();
        assert_eq!(err.code, 422);

        let anything = Param::new("free-form", Value::Null);
        anything.validate_value(&json!({"x": 1})).unwrap();
        anything.validate_value(&json!(42)).unwrap();
    }
}
