use crate::StorageError;

/// Expands `{name}` placeholders in an argv template.
///
/// The first element is the program. Each placeholder is substituted
/// within its argument; arguments are never split, so substituted values
/// need no quoting.
pub fn expand(template: &[String], vars: &[(&str, &str)]) -> Result<Vec<String>, StorageError> {
    if template.is_empty() {
        return Err(StorageError::Template("empty command".into()));
    }
    template
        .iter()
        .map(|arg| substitute(arg, vars))
        .collect()
}

fn substitute(arg: &str, vars: &[(&str, &str)]) -> Result<String, StorageError> {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| StorageError::Template(format!("unclosed placeholder in {arg:?}")))?;
        let name = &after[..close];
        let value = vars
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| *v)
            .ok_or_else(|| StorageError::Template(format!("unknown placeholder {{{name}}}")))?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
