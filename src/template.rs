//! Reads the endpoints out of a SAM-style function template.

use std::{collections::BTreeMap, path::Path};

use anyhow::{anyhow, bail, Context, Result};
use data_model::{Architecture, Endpoint, HandlerDefinition};
use serde::Deserialize;
use serde_yaml::Value;
use tracing::{debug, warn};

const FUNCTION_RESOURCE_TYPE: &str = "AWS::Serverless::Function";
const API_EVENT_TYPES: [&str; 2] = ["Api", "HttpApi"];

/// One declared route and the function that serves it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointMapping {
    pub endpoint: Endpoint,
    pub definition: HandlerDefinition,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Template {
    #[serde(default)]
    globals: Globals,
    #[serde(default)]
    resources: BTreeMap<String, Resource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Globals {
    #[serde(default)]
    function: FunctionProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Resource {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    properties: Value,
}

/// Properties shared by a function and the `Globals.Function` section.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FunctionProperties {
    runtime: Option<String>,
    handler: Option<String>,
    architectures: Option<Vec<String>>,
    code_uri: Option<Value>,
    memory_size: Option<u32>,
    timeout: Option<u32>,
    environment: Option<Environment>,
    #[serde(default)]
    events: BTreeMap<String, Event>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Environment {
    #[serde(default)]
    variables: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Event {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    properties: EventProperties,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct EventProperties {
    path: Option<String>,
    method: Option<String>,
}

pub fn load_template(path: &Path) -> Result<Vec<EndpointMapping>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading template {}", path.display()))?;
    parse_template(&contents).with_context(|| format!("parsing template {}", path.display()))
}

/// Every API event of every function, sorted by logical id, path, then
/// method.
pub fn parse_template(contents: &str) -> Result<Vec<EndpointMapping>> {
    let template: Template = serde_yaml::from_str(contents)?;
    let globals = &template.globals.function;

    let mut mappings = Vec::new();
    for (logical_id, resource) in template.resources {
        if resource.kind != FUNCTION_RESOURCE_TYPE {
            continue;
        }
        let properties: FunctionProperties = serde_yaml::from_value(resource.properties)
            .with_context(|| format!("reading properties of {}", logical_id))?;

        let api_events: Vec<(&String, &Event)> = properties
            .events
            .iter()
            .filter(|(_, event)| API_EVENT_TYPES.contains(&event.kind.as_str()))
            .collect();
        if api_events.is_empty() {
            debug!(function = %logical_id, "function has no API events, skipping");
            continue;
        }

        let definition = handler_definition(&logical_id, &properties, globals)?;
        for (event_name, event) in api_events {
            let (Some(path), Some(method)) = (&event.properties.path, &event.properties.method)
            else {
                warn!(function = %logical_id, event = %event_name, "API event without path or method, skipping");
                continue;
            };
            mappings.push(EndpointMapping {
                endpoint: Endpoint::new(method, path),
                definition: definition.clone(),
            });
        }
    }

    mappings.sort_by(|a, b| {
        (&a.definition.logical_id, &a.endpoint.url_path, &a.endpoint.method).cmp(&(
            &b.definition.logical_id,
            &b.endpoint.url_path,
            &b.endpoint.method,
        ))
    });
    Ok(mappings)
}

fn handler_definition(
    logical_id: &str,
    function: &FunctionProperties,
    globals: &FunctionProperties,
) -> Result<HandlerDefinition> {
    let runtime = function
        .runtime
        .as_ref()
        .or(globals.runtime.as_ref())
        .ok_or_else(|| anyhow!("function {} has no runtime", logical_id))?;
    let handler = function
        .handler
        .as_ref()
        .or(globals.handler.as_ref())
        .ok_or_else(|| anyhow!("function {} has no handler", logical_id))?;

    let mut definition = HandlerDefinition::new(logical_id, runtime, handler);

    let architectures = function
        .architectures
        .as_ref()
        .or(globals.architectures.as_ref());
    if let Some(arch) = architectures.and_then(|a| a.first()) {
        definition.architecture = Architecture::parse(arch)?;
    }
    definition.code_uri = function
        .code_uri
        .as_ref()
        .or(globals.code_uri.as_ref())
        .and_then(|v| v.as_str())
        .map(str::to_string);
    if let Some(memory_size) = function.memory_size.or(globals.memory_size) {
        definition.memory_size_mb = memory_size;
    }
    if let Some(timeout) = function.timeout.or(globals.timeout) {
        definition.timeout_secs = timeout;
    }

    // Function variables override global ones of the same name.
    for environment in [&globals.environment, &function.environment]
        .into_iter()
        .flatten()
    {
        for (name, value) in &environment.variables {
            match scalar_to_string(value) {
                Some(value) => {
                    definition.environment.insert(name.clone(), value);
                }
                None => warn!(
                    function = %logical_id,
                    variable = %name,
                    "environment variable is not a plain value, skipping"
                ),
            }
        }
    }

    Ok(definition)
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
AWSTemplateFormatVersion: '2010-09-09'
Transform: AWS::Serverless-2016-10-31

Globals:
  Function:
    Timeout: 10
    Runtime: python3.12
    Environment:
      Variables:
        STAGE: local
        TABLE: global-table

Resources:
  HelloWorldFunction:
    Type: AWS::Serverless::Function
    Properties:
      CodeUri: hello_world/
      Handler: app.lambda_handler
      Architectures:
        - arm64
      MemorySize: 256
      Environment:
        Variables:
          TABLE: items
          RETRIES: 3
          QUEUE: !Ref Queue
      Events:
        HelloWorld:
          Type: Api
          Properties:
            Path: /hello
            Method: get
        HelloPost:
          Type: Api
          Properties:
            Path: /hello
            Method: POST
        Nightly:
          Type: Schedule
          Properties:
            Schedule: rate(1 day)
  AnotherFunction:
    Type: AWS::Serverless::Function
    Properties:
      CodeUri: another/
      Handler: another.handler
      Runtime: nodejs20.x
      Events:
        Items:
          Type: HttpApi
          Properties:
            Path: /items/{id}
            Method: any
  Worker:
    Type: AWS::Serverless::Function
    Properties:
      Handler: worker.handler
      Events:
        Queue:
          Type: SQS
          Properties:
            Queue: !GetAtt Queue.Arn
  Queue:
    Type: AWS::SQS::Queue

Outputs:
  HelloWorldApi:
    Value: !Sub "https://${ServerlessRestApi}.execute-api.${AWS::Region}.amazonaws.com/Prod/hello/"
"#;

    #[test]
    fn test_parse_template() {
        let mappings = parse_template(TEMPLATE).unwrap();
        let endpoints: Vec<String> = mappings
            .iter()
            .map(|m| format!("{} {}", m.definition.logical_id, m.endpoint))
            .collect();
        assert_eq!(
            endpoints,
            vec![
                "AnotherFunction ANY /items/{id}",
                "HelloWorldFunction GET /hello",
                "HelloWorldFunction POST /hello",
            ]
        );

        let hello = &mappings[1].definition;
        assert_eq!(hello.runtime, "python3.12");
        assert_eq!(hello.handler, "app.lambda_handler");
        assert_eq!(hello.architecture, Architecture::Arm64);
        assert_eq!(hello.code_uri.as_deref(), Some("hello_world/"));
        assert_eq!(hello.memory_size_mb, 256);
        assert_eq!(hello.timeout_secs, 10);
        assert_eq!(hello.environment.get("STAGE").map(String::as_str), Some("local"));
        assert_eq!(hello.environment.get("TABLE").map(String::as_str), Some("items"));
        assert_eq!(hello.environment.get("RETRIES").map(String::as_str), Some("3"));
        assert!(!hello.environment.contains_key("QUEUE"));

        let another = &mappings[0].definition;
        assert_eq!(another.runtime, "nodejs20.x");
        assert_eq!(another.architecture, Architecture::X86_64);
        assert_eq!(another.memory_size_mb, HandlerDefinition::DEFAULT_MEMORY_SIZE_MB);
        assert_eq!(mappings[0].endpoint.method, "any");
    }

    #[test]
    fn test_defaults_without_globals() {
        let template = r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Handler: app.handler
      Runtime: python3.11
      Events:
        Root:
          Type: Api
          Properties:
            Path: /
            Method: get
"#;
        let mappings = parse_template(template).unwrap();
        assert_eq!(mappings.len(), 1);
        let definition = &mappings[0].definition;
        assert_eq!(definition.timeout_secs, HandlerDefinition::DEFAULT_TIMEOUT_SECS);
        assert_eq!(definition.architecture, Architecture::X86_64);
        assert!(definition.code_uri.is_none());
        assert!(definition.environment.is_empty());
    }

    #[test]
    fn test_unsupported_architecture() {
        let template = r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Handler: app.handler
      Runtime: python3.11
      Architectures: [riscv64]
      Events:
        Root:
          Type: Api
          Properties:
            Path: /
            Method: get
"#;
        let err = parse_template(template).unwrap_err();
        assert!(format!("{:#}", err).contains("riscv64"));
    }

    #[test]
    fn test_missing_runtime() {
        let template = r#"
Resources:
  Fn:
    Type: AWS::Serverless::Function
    Properties:
      Handler: app.handler
      Events:
        Root:
          Type: Api
          Properties:
            Path: /
            Method: get
"#;
        assert!(parse_template(template).is_err());
    }

    #[test]
    fn test_load_template() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.yaml");
        std::fs::write(&path, TEMPLATE).unwrap();
        assert_eq!(load_template(&path).unwrap().len(), 3);
        assert!(load_template(&dir.path().join("missing.yaml")).is_err());
    }
}
