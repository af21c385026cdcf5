//! Glue template rendering.
//!
//! Templates use `${name}` placeholders; `$$` renders a literal `$`.
//! Every placeholder must be supplied, so a template change that
//! introduces a new variable fails loudly instead of emitting `${...}`
//! into generated code.

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Glue template shipped with kiln.
pub const BUILTIN_GLUE_TEMPLATE: &str = include_str!("../../templates/module_glue.cpp.template");

/// Load the template at `path`, or the built-in one.
pub fn load_template(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => fs::read_to_string(path).map_err(|e| {
            Error::Toolchain(format!("failed to read glue template {}: {}", path.display(), e))
        }),
        None => Ok(BUILTIN_GLUE_TEMPLATE.to_string()),
    }
}

/// Substitute `${name}` placeholders from `vars`.
pub fn render(template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(body) = after.strip_prefix('{') {
            let end = body.find('}').ok_or_else(|| {
                Error::Toolchain("unterminated placeholder in glue template".to_string())
            })?;
            let key = &body[..end];
            let value = vars
                .iter()
                .find(|(name, _)| *name == key)
                .map(|(_, value)| *value)
                .ok_or_else(|| {
                    Error::Toolchain(format!("glue template placeholder `{}` has no value", key))
                })?;
            out.push_str(value);
            rest = &body[end + 1..];
        } else {
            out.push('$');
            rest = after;
        }
    }

    out.push_str(rest);
    Ok(out)
}
