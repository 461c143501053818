//! Core option registry: unifies the three shapes of the libretro options
//! ABI (legacy `SET_VARIABLES` strings, v1 `retro_core_option_definition`
//! arrays, v2 `retro_core_options_v2`) into one representation the
//! frontend can project into a menu or read back via `GET_VARIABLE`.

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use anyhow::{Context, Result};
use indexmap::IndexMap;

/// Raw FFI mirror of `struct retro_variable` (legacy v0 shape).
#[repr(C)]
pub struct RawVariable {
    pub key: *const c_char,
    pub value: *const c_char,
}

/// Raw FFI mirror of `struct retro_core_option_value`.
#[repr(C)]
pub struct RawOptionValue {
    pub value: *const c_char,
    pub label: *const c_char,
}

/// Raw FFI mirror of `struct retro_core_option_definition` (v1 shape).
#[repr(C)]
pub struct RawOptionDefinition {
    pub key: *const c_char,
    pub desc: *const c_char,
    pub info: *const c_char,
    pub values: [RawOptionValue; 128],
    pub default_value: *const c_char,
}

/// Raw FFI mirror of `struct retro_core_option_v2_category`.
#[repr(C)]
pub struct RawOptionV2Category {
    pub key: *const c_char,
    pub desc: *const c_char,
    pub info: *const c_char,
}

/// Raw FFI mirror of `struct retro_core_option_v2_definition`.
#[repr(C)]
pub struct RawOptionV2Definition {
    pub key: *const c_char,
    pub desc: *const c_char,
    pub desc_categorized: *const c_char,
    pub info: *const c_char,
    pub info_categorized: *const c_char,
    pub category_key: *const c_char,
    pub values: [RawOptionValue; 128],
    pub default_value: *const c_char,
}

/// Raw FFI mirror of `struct retro_core_options_v2`.
#[repr(C)]
pub struct RawOptionsV2 {
    pub categories: *mut RawOptionV2Category,
    pub definitions: *mut RawOptionV2Definition,
}

unsafe fn cstr_opt<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }

    CStr::from_ptr(ptr).to_str().ok()
}

/// A single value/label pair offered by an option.
#[derive(Debug, Clone)]
pub struct OptionValue {
    pub value: String,
    pub label: String,
}

/// One option exposed by the core, regardless of which ABI shape it
/// arrived through.
#[derive(Debug, Clone)]
pub struct Option {
    pub key: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub values: Vec<OptionValue>,
    pub default_index: usize,
    pub current_index: usize,
    /// Set when a higher-priority config file marked this key with a
    /// `-` prefix; locked options are hidden from menu projection.
    pub locked: bool,
    /// Set by `SET_CORE_OPTIONS_DISPLAY` to hide an option without
    /// locking its value.
    pub visible: bool,
    current_value_cstr: CString,
}

impl Option {
    fn new(
        key: String,
        name: String,
        description: Option<String>,
        category: Option<String>,
        values: Vec<OptionValue>,
        default_index: usize,
    ) -> Self {
        let current_value_cstr =
            CString::new(values[default_index].value.clone()).unwrap_or_default();

        Self {
            key,
            name,
            description,
            category,
            values,
            default_index,
            current_index: default_index,
            locked: false,
            visible: true,
            current_value_cstr,
        }
    }

    pub fn current_value(&self) -> &str {
        &self.values[self.current_index].value
    }

    pub fn value_cstr(&self) -> &CStr {
        &self.current_value_cstr
    }

    /// Sets the option by literal value string, matching spec.md's "never
    /// silently fall back to default" rule: unknown values are refused
    /// and logged, not coerced.
    pub fn set_value(&mut self, value: &str) -> bool {
        match self.values.iter().position(|v| v.value == value) {
            Some(index) => {
                self.current_index = index;
                self.current_value_cstr = CString::new(value).unwrap_or_default();
                true
            }
            None => {
                eprintln!(
                    "WARNING: unknown value `{value}` for option `{}`, keeping `{}`",
                    self.key,
                    self.current_value()
                );
                false
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptionCategory {
    pub key: String,
    pub description: String,
    pub info: Option<String>,
}

/// Which of the three ABI shapes populated this registry. Exposed so a
/// second, later call can be rejected (first shape wins, no append).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Legacy,
    V1,
    V2,
}

#[derive(Default)]
pub struct OptionRegistry {
    options: IndexMap<String, Option>,
    categories: Vec<OptionCategory>,
    shape: std::option::Option<Shape>,
    changed: bool,
}

impl OptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn accept_shape(&mut self, shape: Shape) -> bool {
        if self.shape.is_some() {
            eprintln!(
                "WARNING: ignoring {shape:?} options, registry already populated by {:?}",
                self.shape.unwrap()
            );
            return false;
        }

        self.shape = Some(shape);
        true
    }

    /// `SET_VARIABLES`: `"description; default|opt2|opt3"` strings.
    ///
    /// # Safety
    /// `vars` must point to a NULL-terminated array of `RawVariable`.
    pub unsafe fn set_variables(&mut self, vars: *const RawVariable) -> bool {
        if !self.accept_shape(Shape::Legacy) {
            return false;
        }

        let mut i = 0;
        loop {
            let var = &*vars.add(i);
            if var.key.is_null() {
                break;
            }

            let Some(key) = cstr_opt(var.key) else {
                break;
            };
            let Some(value) = cstr_opt(var.value) else {
                break;
            };

            match parse_legacy_value(value) {
                Ok((name, values)) => {
                    self.options.insert(
                        key.to_owned(),
                        Option::new(key.to_owned(), name, None, None, values, 0),
                    );
                }
                Err(err) => {
                    eprintln!("WARNING: failed to parse legacy variable `{key}`: {err}");
                }
            }

            i += 1;
        }

        true
    }

    /// `SET_CORE_OPTIONS` (v1).
    ///
    /// # Safety
    /// `defs` must point to a NULL-terminated (by `.key`) array of
    /// `RawOptionDefinition`.
    pub unsafe fn set_core_options(&mut self, defs: *const RawOptionDefinition) -> bool {
        if !self.accept_shape(Shape::V1) {
            return false;
        }

        let mut i = 0;
        loop {
            let def = &*defs.add(i);
            if def.key.is_null() {
                break;
            }

            let Some(key) = cstr_opt(def.key) else {
                break;
            };
            let Some(desc) = cstr_opt(def.desc) else {
                i += 1;
                continue;
            };
            let info = cstr_opt(def.info).map(str::to_owned);
            let values = collect_values(&def.values);

            if values.is_empty() {
                i += 1;
                continue;
            }

            let default = cstr_opt(def.default_value).unwrap_or(&values[0].value);
            let default_index = values.iter().position(|v| v.value == default).unwrap_or(0);

            self.options.insert(
                key.to_owned(),
                Option::new(
                    key.to_owned(),
                    desc.to_owned(),
                    info,
                    None,
                    values,
                    default_index,
                ),
            );

            i += 1;
        }

        true
    }

    /// `SET_CORE_OPTIONS` (v2): categories + definitions.
    ///
    /// # Safety
    /// `opts` must be non-null and point to a valid `RawOptionsV2` whose
    /// `categories`/`definitions` arrays are NULL-terminated (by `.key`).
    pub unsafe fn set_core_options_v2(&mut self, opts: *const RawOptionsV2) -> bool {
        if opts.is_null() || !self.accept_shape(Shape::V2) {
            return false;
        }

        let opts = &*opts;

        if !opts.categories.is_null() {
            let mut i = 0;
            loop {
                let cat = &*opts.categories.add(i);
                if cat.key.is_null() {
                    break;
                }

                if let (Some(key), Some(desc)) = (cstr_opt(cat.key), cstr_opt(cat.desc)) {
                    self.categories.push(OptionCategory {
                        key: key.to_owned(),
                        description: desc.to_owned(),
                        info: cstr_opt(cat.info).map(str::to_owned),
                    });
                }

                i += 1;
            }
        }

        let mut i = 0;
        loop {
            let def = &*opts.definitions.add(i);
            if def.key.is_null() {
                break;
            }

            let Some(key) = cstr_opt(def.key) else {
                i += 1;
                continue;
            };
            let desc = cstr_opt(def.desc_categorized)
                .or_else(|| cstr_opt(def.desc))
                .unwrap_or(key);
            let info = cstr_opt(def.info_categorized)
                .or_else(|| cstr_opt(def.info))
                .map(str::to_owned);
            let category = cstr_opt(def.category_key).map(str::to_owned);
            let values = collect_values(&def.values);

            if values.is_empty() {
                i += 1;
                continue;
            }

            let default = cstr_opt(def.default_value).unwrap_or(&values[0].value);
            let default_index = values.iter().position(|v| v.value == default).unwrap_or(0);

            self.options.insert(
                key.to_owned(),
                Option::new(
                    key.to_owned(),
                    desc.to_owned(),
                    info,
                    category,
                    values,
                    default_index,
                ),
            );

            i += 1;
        }

        true
    }

    /// `GET_VARIABLE`: looks up a key and writes its current value into
    /// the pointed-to `RawVariable::value`.
    ///
    /// # Safety
    /// `var` must be non-null and point to a valid `RawVariable`.
    pub unsafe fn get_variable(&self, var: *mut RawVariable) -> bool {
        let Some(var) = var.as_mut() else {
            eprintln!("BUG: get_variable called with null variable");
            return false;
        };

        let Some(key) = cstr_opt(var.key) else {
            eprintln!("WARNING: get_variable called with null key");
            return false;
        };

        match self.options.get(key) {
            Some(option) => {
                var.value = option.value_cstr().as_ptr();
                true
            }
            None => {
                eprintln!("WARNING: get_variable called with unknown key `{key}`");
                var.value = ptr::null();
                false
            }
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> bool {
        let Some(option) = self.options.get_mut(key) else {
            eprintln!("WARNING: set_value for unknown option `{key}`");
            return false;
        };

        if option.locked {
            eprintln!("WARNING: refusing to change locked option `{key}`");
            return false;
        }

        let changed = option.set_value(value);
        self.changed |= changed;

        changed
    }

    pub fn lock(&mut self, key: &str) {
        if let Some(option) = self.options.get_mut(key) {
            option.locked = true;
        }
    }

    pub fn set_display(&mut self, key: &str, visible: bool) {
        if let Some(option) = self.options.get_mut(key) {
            option.visible = visible;
        }
    }

    pub fn get(&self, key: &str) -> std::option::Option<&Option> {
        self.options.get(key)
    }

    pub fn categories(&self) -> &[OptionCategory] {
        &self.categories
    }

    /// Every key the core registered, regardless of lock/visibility state;
    /// used by the host loop to apply a config file's overrides/locks
    /// before the first `run()`.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.options.keys().map(String::as_str)
    }

    /// Lazily rebuilt projection of menu-visible options: unlocked and
    /// not explicitly hidden by `SET_CORE_OPTIONS_DISPLAY`.
    pub fn enabled_options(&self) -> impl Iterator<Item = &Option> {
        self.options.values().filter(|o| !o.locked && o.visible)
    }

    /// `GET_VARIABLE_UPDATE`: true if a variable changed since the last
    /// call, then resets the flag.
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }
}

fn parse_legacy_value(value: &str) -> Result<(String, Vec<OptionValue>)> {
    let (name, options) = value.split_once("; ").context("variable is missing `; `")?;
    let values = options
        .split('|')
        .map(|value| OptionValue {
            value: value.to_owned(),
            label: value.to_owned(),
        })
        .collect::<Vec<_>>();

    if values.is_empty() {
        anyhow::bail!("variable has no values");
    }

    Ok((name.to_owned(), values))
}

unsafe fn collect_values(raw: &[RawOptionValue; 128]) -> Vec<OptionValue> {
    let mut values = Vec::new();

    for entry in raw {
        let Some(value) = cstr_opt(entry.value) else {
            break;
        };

        let label = cstr_opt(entry.label).unwrap_or(value);

        values.push(OptionValue {
            value: value.to_owned(),
            label: label.to_owned(),
        });
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_legacy_value() {
        let (name, values) = parse_legacy_value("Turbo speed; 2|3|4").unwrap();
        assert_eq!(name, "Turbo speed");
        assert_eq!(values.len(), 3);
        assert_eq!(values[0].value, "2");
    }

    #[test]
    fn legacy_first_entry_is_default() {
        let mut registry = OptionRegistry::new();
        let key = CString::new("turbo_speed").unwrap();
        let value = CString::new("Turbo speed; 2|3|4").unwrap();
        let vars = [
            RawVariable {
                key: key.as_ptr(),
                value: value.as_ptr(),
            },
            RawVariable {
                key: ptr::null(),
                value: ptr::null(),
            },
        ];

        unsafe {
            registry.set_variables(vars.as_ptr());
        }

        let option = registry.get("turbo_speed").unwrap();
        assert_eq!(option.current_value(), "2");
    }

    #[test]
    fn second_shape_is_rejected() {
        let mut registry = OptionRegistry::new();
        let key = CString::new("k").unwrap();
        let value = CString::new("d; a|b").unwrap();
        let vars = [
            RawVariable {
                key: key.as_ptr(),
                value: value.as_ptr(),
            },
            RawVariable {
                key: ptr::null(),
                value: ptr::null(),
            },
        ];

        unsafe {
            assert!(registry.set_variables(vars.as_ptr()));
            assert!(!registry.set_variables(vars.as_ptr()));
        }
    }

    #[test]
    fn unknown_value_is_refused() {
        let mut registry = OptionRegistry::new();
        let key = CString::new("k").unwrap();
        let value = CString::new("d; a|b").unwrap();
        let vars = [
            RawVariable {
                key: key.as_ptr(),
                value: value.as_ptr(),
            },
            RawVariable {
                key: ptr::null(),
                value: ptr::null(),
            },
        ];

        unsafe {
            registry.set_variables(vars.as_ptr());
        }

        assert!(!registry.set_value("k", "nope"));
        assert_eq!(registry.get("k").unwrap().current_value(), "a");
    }

    #[test]
    fn locked_option_rejects_changes() {
        let mut registry = OptionRegistry::new();
        let key = CString::new("k").unwrap();
        let value = CString::new("d; a|b").unwrap();
        let vars = [
            RawVariable {
                key: key.as_ptr(),
                value: value.as_ptr(),
            },
            RawVariable {
                key: ptr::null(),
                value: ptr::null(),
            },
        ];

        unsafe {
            registry.set_variables(vars.as_ptr());
        }

        registry.lock("k");
        assert!(!registry.set_value("k", "b"));
        assert_eq!(registry.get("k").unwrap().current_value(), "a");
    }
}
