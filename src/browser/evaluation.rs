use anyhow::anyhow;
use chromiumoxide::{Page, cdp::js_protocol::runtime};
use serde_json as json;

use crate::browser::BrowserError;

pub fn function_call_expression(
    function_expression: &str,
    arguments: &[json::Value],
) -> Result<String, json::Error> {
    let mut arguments_json = Vec::with_capacity(arguments.len());
    for arg in arguments {
        arguments_json.push(json::to_string(arg)?);
    }
    Ok(format!(
        "({})({})",
        function_expression,
        arguments_json.join(", ")
    ))
}

pub async fn evaluate_function_call(
    page: &Page,
    function_expression: &str,
    arguments: Vec<json::Value>,
) -> Result<json::Value, BrowserError> {
    let expression = function_call_expression(function_expression, &arguments)
        .map_err(|err| anyhow!(err))?;
    let params = runtime::EvaluateParams::builder()
        .expression(expression)
        .await_promise(true)
        .return_by_value(true)
        .build()
        .map_err(|err| anyhow!(err).context("build EvaluateParams failed"))?;
    let result = page.evaluate_expression(params).await?;
    Ok(result.value().cloned().unwrap_or(json::Value::Null))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_function_call_expression() {
        let expression = function_call_expression(
            "(key, value) => localStorage.setItem(key, value)",
            &[json!("sb-auth"), json!("{\"a\":1}")],
        )
        .unwrap();
        assert_eq!(
            expression,
            r#"((key, value) => localStorage.setItem(key, value))("sb-auth", "{\"a\":1}")"#
        );
    }

    #[test]
    fn test_function_call_without_arguments() {
        let expression =
            function_call_expression("() => document.title", &[]).unwrap();
        assert_eq!(expression, "(() => document.title)()");
    }
}
