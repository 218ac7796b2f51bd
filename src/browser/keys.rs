#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyDefinition {
    pub key: String,
    pub code: String,
    pub key_code: i64,
    pub text: Option<String>,
}

fn named(key: &str, code: &str, key_code: i64, text: Option<&str>) -> KeyDefinition {
    KeyDefinition {
        key: key.to_string(),
        code: code.to_string(),
        key_code,
        text: text.map(str::to_string),
    }
}

pub fn key_definition(name: &str) -> Option<KeyDefinition> {
    let definition = match name {
        "Enter" => named("Enter", "Enter", 13, Some("\r")),
        "Escape" => named("Escape", "Escape", 27, None),
        "Tab" => named("Tab", "Tab", 9, None),
        "Backspace" => named("Backspace", "Backspace", 8, None),
        "Delete" => named("Delete", "Delete", 46, None),
        "Space" | " " => named(" ", "Space", 32, Some(" ")),
        "ArrowUp" => named("ArrowUp", "ArrowUp", 38, None),
        "ArrowDown" => named("ArrowDown", "ArrowDown", 40, None),
        "ArrowLeft" => named("ArrowLeft", "ArrowLeft", 37, None),
        "ArrowRight" => named("ArrowRight", "ArrowRight", 39, None),
        "Home" => named("Home", "Home", 36, None),
        "End" => named("End", "End", 35, None),
        "PageUp" => named("PageUp", "PageUp", 33, None),
        "PageDown" => named("PageDown", "PageDown", 34, None),
        other => return character(other),
    };
    Some(definition)
}

fn character(name: &str) -> Option<KeyDefinition> {
    let mut chars = name.chars();
    let (Some(c), None) = (chars.next(), chars.next()) else {
        return None;
    };
    let code = if c.is_ascii_alphabetic() {
        format!("Key{}", c.to_ascii_uppercase())
    } else if c.is_ascii_digit() {
        format!("Digit{}", c)
    } else {
        String::new()
    };
    let key_code = if c.is_ascii_alphanumeric() {
        c.to_ascii_uppercase() as i64
    } else {
        0
    };
    Some(KeyDefinition {
        key: c.to_string(),
        code,
        key_code,
        text: Some(c.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_keys() {
        let enter = key_definition("Enter").unwrap();
        assert_eq!(enter.key_code, 13);
        assert_eq!(enter.text.as_deref(), Some("\r"));
        assert_eq!(key_definition("Escape").unwrap().text, None);
    }

    #[test]
    fn test_single_characters() {
        let a = key_definition("a").unwrap();
        assert_eq!(a.code, "KeyA");
        assert_eq!(a.key_code, 65);
        assert_eq!(key_definition("7").unwrap().code, "Digit7");
    }

    #[test]
    fn test_unknown_key() {
        assert_eq!(key_definition("Hyper"), None);
    }
}
