//! Expands a technique's permutation dimensions into concrete permutations.
//!
//! Each dimension `NAME: [bit_exponent, [values...]]` contributes
//! `2^(bit_exponent + max(0, value - 1))` to the permutation id for every
//! non-zero value; pseudo defines (backend names, plain `defines`) carry a
//! bit exponent of `-1` and never contribute.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::manifest::TechniqueSpec;
use crate::ordered::Ordered;

pub const SINGLE_PERMUTATION: &str = "SINGLE_PERMUTATION";

#[derive(Debug, Clone, PartialEq)]
pub struct DefineEntry {
    pub name: String,
    pub values: Vec<i64>,
    pub bit_exponent: i32,
}

impl DefineEntry {
    fn always_on(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![1],
            bit_exponent: -1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Permutation {
    pub technique: String,
    pub id: u64,
    /// Every define of the technique exactly once, in declaration order.
    pub defines: Vec<(String, i64)>,
}

impl Permutation {
    /// `<technique>` for the default permutation, `<technique>__<id>__` otherwise.
    pub fn name(&self) -> String {
        if self.id == 0 {
            self.technique.clone()
        } else {
            format!("{}__{}__", self.technique, self.id)
        }
    }

    pub fn env(&self) -> HashMap<String, i64> {
        self.defines.iter().cloned().collect()
    }

    pub fn value(&self, name: &str) -> Option<i64> {
        self.defines
            .iter()
            .find(|(define, _)| define == name)
            .map(|(_, value)| *value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    Checkbox,
    InputInt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermutationOption {
    pub val: u64,
    #[serde(rename = "type")]
    pub kind: OptionKind,
}

#[derive(Debug, Clone)]
pub struct PermutationSet {
    pub define_list: Vec<DefineEntry>,
    pub permutations: Vec<Permutation>,
    pub options: Ordered<PermutationOption>,
    pub option_mask: u64,
    /// `#define <TECHNIQUE>_<NAME> <mask>` lines for the material header.
    pub c_defines: String,
}

pub fn generate(technique: &str, spec: &TechniqueSpec, platform_defines: &[&str]) -> PermutationSet {
    let mut define_list: Vec<DefineEntry> = platform_defines
        .iter()
        .map(|name| DefineEntry::always_on(*name))
        .collect();
    for (name, dimension) in spec.permutations.iter() {
        define_list.push(DefineEntry {
            name: name.to_string(),
            values: dimension.values().to_vec(),
            bit_exponent: dimension.bit_exponent(),
        });
    }
    for define in &spec.defines {
        define_list.push(DefineEntry::always_on(define.clone()));
    }

    let mut options = Ordered::new();
    let mut option_mask = 0u64;
    let mut c_defines = String::new();
    if !spec.permutations.is_empty() {
        for (name, dimension) in spec.permutations.iter() {
            let val = bit_value(dimension.bit_exponent());
            let kind = if dimension.values().len() <= 2 {
                OptionKind::Checkbox
            } else {
                OptionKind::InputInt
            };
            options.insert(name, PermutationOption { val, kind });
            option_mask |= val;
            c_defines.push_str(&format!(
                "#define {}_{} {}\n",
                technique.to_uppercase(),
                name,
                val
            ));
        }
        c_defines.push('\n');
    }

    let permutations = if spec.permutations.is_empty() {
        vec![default_permutation(technique, spec, platform_defines)]
    } else {
        cartesian_product(&define_list)
            .into_iter()
            .map(|defines| Permutation {
                technique: technique.to_string(),
                id: permutation_id(&define_list, &defines),
                defines,
            })
            .collect()
    };

    PermutationSet {
        define_list,
        permutations,
        options,
        option_mask,
        c_defines,
    }
}

fn default_permutation(technique: &str, spec: &TechniqueSpec, platform_defines: &[&str]) -> Permutation {
    let mut defines: Vec<(String, i64)> = platform_defines
        .iter()
        .map(|name| (name.to_string(), 1))
        .collect();
    if spec.defines.is_empty() {
        defines.push((SINGLE_PERMUTATION.to_string(), 1));
    } else {
        defines.extend(spec.defines.iter().map(|define| (define.clone(), 1)));
    }
    Permutation {
        technique: technique.to_string(),
        id: 0,
        defines,
    }
}

/// Every combination of values; the first entry varies fastest.
fn cartesian_product(define_list: &[DefineEntry]) -> Vec<Vec<(String, i64)>> {
    let mut combinations: Vec<Vec<(String, i64)>> = vec![Vec::new()];
    for entry in define_list {
        if entry.values.is_empty() {
            warn!(define = %entry.name, "permutation dimension has no values");
            return Vec::new();
        }
        let mut next = Vec::with_capacity(combinations.len() * entry.values.len());
        for value in &entry.values {
            for combination in &combinations {
                let mut extended = combination.clone();
                extended.push((entry.name.clone(), *value));
                next.push(extended);
            }
        }
        combinations = next;
    }
    combinations
}

pub fn permutation_id(define_list: &[DefineEntry], defines: &[(String, i64)]) -> u64 {
    defines
        .iter()
        .filter(|(_, value)| *value > 0)
        .filter_map(|(name, value)| {
            let entry = define_list.iter().find(|entry| entry.name == *name)?;
            if entry.bit_exponent < 0 {
                return None;
            }
            let exponent = i64::from(entry.bit_exponent) + (value - 1).max(0);
            Some(bit_value_i64(exponent))
        })
        .sum()
}

fn bit_value(exponent: i32) -> u64 {
    bit_value_i64(i64::from(exponent))
}

fn bit_value_i64(exponent: i64) -> u64 {
    u32::try_from(exponent)
        .ok()
        .and_then(|shift| 1u64.checked_shl(shift))
        .unwrap_or_else(|| {
            warn!(exponent, "permutation bit exponent out of range");
            0
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::PermutationSpec;

    fn spec(permutations: &[(&str, i32, &[i64])], defines: &[&str]) -> TechniqueSpec {
        TechniqueSpec {
            permutations: permutations
                .iter()
                .map(|(name, bit, values)| (name.to_string(), PermutationSpec(*bit, values.to_vec())))
                .collect(),
            defines: defines.iter().map(|d| d.to_string()).collect(),
            ..TechniqueSpec::default()
        }
    }

    #[test]
    fn two_boolean_dimensions_enumerate_ids() {
        let set = generate(
            "lit",
            &spec(&[("SKINNED", 0, &[0, 1]), ("SHADOWED", 1, &[0, 1])], &[]),
            &["HLSL"],
        );
        let ids: Vec<u64> = set.permutations.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(set.option_mask, 3);
        assert_eq!(set.options.get("SHADOWED").unwrap().kind, OptionKind::Checkbox);
        assert_eq!(set.c_defines, "#define LIT_SKINNED 1\n#define LIT_SHADOWED 2\n\n");
        for permutation in &set.permutations {
            assert_eq!(permutation.value("HLSL"), Some(1));
            assert_eq!(permutation.defines.len(), 3);
        }
    }

    #[test]
    fn multi_value_dimension_occupies_a_bit_run() {
        let set = generate(
            "lit",
            &spec(
                &[("SKINNED", 0, &[0, 1]), ("SHADOWED", 1, &[0, 1]), ("LIGHT_COUNT", 4, &[0, 1, 2, 3])],
                &[],
            ),
            &["METAL"],
        );
        assert_eq!(set.permutations.len(), 16);
        let target = set
            .permutations
            .iter()
            .find(|p| {
                p.value("SKINNED") == Some(1) && p.value("SHADOWED") == Some(0) && p.value("LIGHT_COUNT") == Some(2)
            })
            .unwrap();
        assert_eq!(target.id, 33);
        assert_eq!(target.name(), "lit__33__");
        assert_eq!(set.options.get("LIGHT_COUNT").unwrap().kind, OptionKind::InputInt);

        let mut ids: Vec<u64> = set.permutations.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn id_ignores_define_order() {
        let set = generate("t", &spec(&[("A", 0, &[0, 1]), ("B", 2, &[0, 1, 2])], &[]), &[]);
        let forward = vec![("A".to_string(), 1), ("B".to_string(), 2)];
        let reversed = vec![("B".to_string(), 2), ("A".to_string(), 1)];
        assert_eq!(permutation_id(&set.define_list, &forward), 9);
        assert_eq!(permutation_id(&set.define_list, &reversed), 9);
    }

    #[test]
    fn no_permutations_yields_single_default() {
        let set = generate("plain", &spec(&[], &[]), &["GLSL", "GLES"]);
        assert_eq!(set.permutations.len(), 1);
        let only = &set.permutations[0];
        assert_eq!(only.id, 0);
        assert_eq!(only.name(), "plain");
        assert_eq!(only.value(SINGLE_PERMUTATION), Some(1));
        assert_eq!(only.value("GLES"), Some(1));
        assert!(set.c_defines.is_empty());
        assert_eq!(set.option_mask, 0);
    }

    #[test]
    fn plain_defines_replace_single_permutation_sentinel() {
        let set = generate("plain", &spec(&[], &["USE_FOG"]), &["HLSL"]);
        let only = &set.permutations[0];
        assert_eq!(only.value("USE_FOG"), Some(1));
        assert_eq!(only.value(SINGLE_PERMUTATION), None);
    }
}
