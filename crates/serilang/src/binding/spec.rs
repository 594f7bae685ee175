//! Declarative argument-list specifications and the binding algorithm.
//!
//! An [`ArgSpec`] records how many parameters a native callable takes, which
//! of them may be passed by keyword, their defaults, and whether trailing
//! vararg/kwarg carriers absorb the excess. Specs are validated eagerly at
//! registration; dispatch then binds a concrete call's positional and
//! keyword arguments against the spec, producing a [`BoundArgs`].

use std::{fmt, rc::Rc};

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    error::{RunError, RunResult},
    value::Value,
};

/// Keyword-argument sink passed to natives with a kwarg carrier.
pub type KwargMap = IndexMap<String, Value, ahash::RandomState>;

/// Lazily-evaluated default value.
pub type DefaultFn = Rc<dyn Fn() -> Value>;

/// One named parameter in a registration.
#[derive(Clone)]
pub struct Param {
    name: String,
    default: Option<DefaultFn>,
    kw_only: bool,
}

/// Starts a parameter description.
#[must_use]
pub fn param(name: impl Into<String>) -> Param {
    Param {
        name: name.into(),
        default: None,
        kw_only: false,
    }
}

impl Param {
    /// Attaches a lazily-evaluated default.
    #[must_use]
    pub fn default_with(mut self, make: impl Fn() -> Value + 'static) -> Self {
        self.default = Some(Rc::new(make));
        self
    }

    /// Attaches a constant default.
    #[must_use]
    pub fn default_value(self, value: Value) -> Self {
        self.default_with(move || value.clone())
    }

    /// Marks the parameter keyword-only.
    #[must_use]
    pub fn kw_only(mut self) -> Self {
        self.kw_only = true;
        self
    }
}

impl fmt::Debug for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Param")
            .field("name", &self.name)
            .field("has_default", &self.default.is_some())
            .field("kw_only", &self.kw_only)
            .finish()
    }
}

/// The parameter shape of one bound callable.
pub struct ArgSpec {
    /// Total named parameters (excluding carriers).
    nparam: usize,
    /// Leading parameters fillable by position; the rest are keyword-only.
    npos: usize,
    /// Keyword name to parameter index.
    param_index: AHashMap<String, usize>,
    /// Reverse of `param_index`, for error messages.
    param_names: Vec<Option<String>>,
    /// Per-index default providers.
    defaults: Vec<Option<DefaultFn>>,
    has_vararg: bool,
    has_kwarg: bool,
}

impl fmt::Debug for ArgSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArgSpec")
            .field("nparam", &self.nparam)
            .field("npos", &self.npos)
            .field("has_vararg", &self.has_vararg)
            .field("has_kwarg", &self.has_kwarg)
            .finish_non_exhaustive()
    }
}

/// Arguments bound against a spec, ready for the casters.
#[derive(Debug, Default)]
pub struct BoundArgs {
    /// One value per named parameter, in declaration order.
    pub params: Vec<Value>,
    /// Excess positionals, when the spec has a vararg carrier.
    pub varargs: Vec<Value>,
    /// Unknown keywords, when the spec has a kwarg carrier.
    pub kwargs: KwargMap,
}

impl ArgSpec {
    /// A spec with `nparam` anonymous positional parameters, as derived from
    /// a host signature. Keywords cannot bind to anonymous parameters.
    #[must_use]
    pub fn positional(nparam: usize, has_vararg: bool, has_kwarg: bool) -> Self {
        Self {
            nparam,
            npos: nparam,
            param_index: AHashMap::new(),
            param_names: vec![None; nparam],
            defaults: vec![None; nparam],
            has_vararg,
            has_kwarg,
        }
    }

    /// Builds a spec from named parameters, enforcing the registration
    /// rules: unique names, keyword-only parameters after all
    /// positional-or-keyword ones.
    pub fn from_params(params: Vec<Param>, has_vararg: bool, has_kwarg: bool) -> RunResult<Self> {
        let nparam = params.len();
        let mut spec = Self {
            nparam,
            npos: 0,
            param_index: AHashMap::with_capacity(nparam),
            param_names: Vec::with_capacity(nparam),
            defaults: Vec::with_capacity(nparam),
            has_vararg,
            has_kwarg,
        };
        let mut seen_kw_only = false;
        for (index, p) in params.into_iter().enumerate() {
            if spec.param_index.insert(p.name.clone(), index).is_some() {
                return Err(RunError::internal(format!(
                    "duplicate parameter '{}'",
                    p.name
                )));
            }
            if p.kw_only {
                seen_kw_only = true;
            } else {
                if seen_kw_only {
                    return Err(RunError::internal(
                        "positional parameters must appear before any keyword-only parameter",
                    ));
                }
                spec.npos += 1;
            }
            spec.param_names.push(Some(p.name));
            spec.defaults.push(p.default);
        }
        Ok(spec)
    }

    /// Prepends an anonymous required parameter; used to account for the
    /// receiver slot of native methods registered with named parameters.
    #[must_use]
    pub fn prepend_receiver(mut self) -> Self {
        self.nparam += 1;
        self.npos += 1;
        for index in self.param_index.values_mut() {
            *index += 1;
        }
        self.param_names.insert(0, None);
        self.defaults.insert(0, None);
        self
    }

    /// Total named parameters.
    #[must_use]
    pub fn nparam(&self) -> usize {
        self.nparam
    }

    /// True when excess positionals flow into a vararg carrier.
    #[must_use]
    pub fn has_vararg(&self) -> bool {
        self.has_vararg
    }

    /// True when unknown keywords flow into a kwarg carrier.
    #[must_use]
    pub fn has_kwarg(&self) -> bool {
        self.has_kwarg
    }

    fn param_label(&self, index: usize) -> String {
        match self.param_names.get(index) {
            Some(Some(name)) => format!("'{name}'"),
            _ => format!("#{index}"),
        }
    }

    /// Binds a call's arguments against this spec.
    ///
    /// `name` is the callable's name, used in error messages. Positional
    /// arguments fill parameter slots left to right; the remainder flows
    /// into the vararg carrier. Keywords bind by name, unknown ones flow
    /// into the kwarg carrier, and still-unbound parameters are filled from
    /// defaults.
    pub fn bind(
        &self,
        name: &str,
        positionals: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> RunResult<BoundArgs> {
        let mut out = BoundArgs {
            params: vec![Value::Nil; self.nparam],
            varargs: Vec::new(),
            kwargs: KwargMap::default(),
        };
        let mut assigned = vec![false; self.nparam];

        let npositional = positionals.len();
        let mut positionals = positionals.into_iter();
        for (index, slot) in assigned.iter_mut().enumerate().take(npositional.min(self.npos)) {
            // Iterator still has items here by construction.
            if let Some(v) = positionals.next() {
                out.params[index] = v;
                *slot = true;
            }
        }
        let rest: Vec<Value> = positionals.collect();
        if !rest.is_empty() {
            if !self.has_vararg {
                return Err(RunError::arity(format!("{name}(): too many arguments")));
            }
            out.varargs = rest;
        }

        for (key, value) in keywords {
            match self.param_index.get(&key) {
                Some(&index) => {
                    if assigned[index] {
                        return Err(RunError::arity(format!(
                            "{name}(): multiple values for argument '{key}'"
                        )));
                    }
                    out.params[index] = value;
                    assigned[index] = true;
                }
                None => {
                    if !self.has_kwarg {
                        return Err(RunError::arity(format!(
                            "{name}(): unexpected keyword argument '{key}'"
                        )));
                    }
                    if out.kwargs.insert(key.clone(), value).is_some() {
                        return Err(RunError::arity(format!(
                            "{name}(): duplicate keyword '{key}'"
                        )));
                    }
                }
            }
        }

        for (index, was_assigned) in assigned.iter().enumerate() {
            if *was_assigned {
                continue;
            }
            match &self.defaults[index] {
                Some(make) => out.params[index] = make(),
                None => {
                    return Err(RunError::arity(format!(
                        "{name}(): missing argument {}",
                        self.param_label(index)
                    )));
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(params: Vec<Param>) -> ArgSpec {
        ArgSpec::from_params(params, false, false).unwrap()
    }

    #[test]
    fn positional_fill_and_defaults() {
        let s = spec(vec![param("a"), param("b").default_value(Value::Int(9))]);
        let bound = s.bind("f", vec![Value::Int(1)], vec![]).unwrap();
        assert!(matches!(bound.params[0], Value::Int(1)));
        assert!(matches!(bound.params[1], Value::Int(9)));
    }

    #[test]
    fn keyword_binds_by_name() {
        let s = spec(vec![param("a"), param("b")]);
        let bound = s
            .bind(
                "f",
                vec![Value::Int(1)],
                vec![("b".to_owned(), Value::Int(2))],
            )
            .unwrap();
        assert!(matches!(bound.params[1], Value::Int(2)));
    }

    #[test]
    fn keyword_duplicate_of_positional_is_rejected() {
        let s = spec(vec![param("a")]);
        let err = s
            .bind(
                "f",
                vec![Value::Int(1)],
                vec![("a".to_owned(), Value::Int(2))],
            )
            .unwrap_err();
        assert!(err.message.contains("multiple values for argument 'a'"));
    }

    #[test]
    fn missing_required_argument() {
        let s = spec(vec![param("a"), param("b")]);
        let err = s.bind("f", vec![Value::Int(1)], vec![]).unwrap_err();
        assert!(err.message.contains("missing argument 'b'"));
    }

    #[test]
    fn excess_positionals_need_vararg() {
        let s = spec(vec![param("a")]);
        let err = s.bind("f", vec![Value::Int(1), Value::Int(2)], vec![]).unwrap_err();
        assert!(err.message.contains("too many arguments"));

        let s = ArgSpec::from_params(vec![param("a")], true, false).unwrap();
        let bound = s.bind("f", vec![Value::Int(1), Value::Int(2)], vec![]).unwrap();
        assert_eq!(bound.varargs.len(), 1);
    }

    #[test]
    fn unknown_keyword_needs_kwarg_sink() {
        let s = spec(vec![param("a")]);
        let err = s
            .bind("f", vec![Value::Int(1)], vec![("z".to_owned(), Value::Nil)])
            .unwrap_err();
        assert!(err.message.contains("unexpected keyword argument 'z'"));

        let s = ArgSpec::from_params(vec![param("a")], false, true).unwrap();
        let bound = s
            .bind("f", vec![Value::Int(1)], vec![("z".to_owned(), Value::Int(3))])
            .unwrap();
        assert!(matches!(bound.kwargs.get("z"), Some(Value::Int(3))));
    }

    #[test]
    fn kw_only_cannot_bind_positionally() {
        let s = spec(vec![param("a"), param("b").kw_only().default_value(Value::Nil)]);
        // Two positionals but only one positional slot.
        let err = s.bind("f", vec![Value::Int(1), Value::Int(2)], vec![]).unwrap_err();
        assert!(err.message.contains("too many arguments"));
        let bound = s
            .bind(
                "f",
                vec![Value::Int(1)],
                vec![("b".to_owned(), Value::Int(2))],
            )
            .unwrap();
        assert!(matches!(bound.params[1], Value::Int(2)));
    }

    #[test]
    fn registration_rejects_duplicates_and_misordered_kw_only() {
        let err = ArgSpec::from_params(vec![param("a"), param("a")], false, false).unwrap_err();
        assert!(err.message.contains("duplicate parameter 'a'"));

        let err =
            ArgSpec::from_params(vec![param("a").kw_only(), param("b")], false, false).unwrap_err();
        assert!(err.message.contains("keyword-only"));
    }

    #[test]
    fn prepend_receiver_shifts_indices() {
        let s = spec(vec![param("x")]).prepend_receiver();
        assert_eq!(s.nparam(), 2);
        let bound = s
            .bind(
                "m",
                vec![Value::str("self")],
                vec![("x".to_owned(), Value::Int(5))],
            )
            .unwrap();
        assert_eq!(bound.params[0].as_str(), Some("self"));
        assert!(matches!(bound.params[1], Value::Int(5)));
    }
}
