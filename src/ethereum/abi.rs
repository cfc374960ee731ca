use alloy::dyn_abi::{DynSolValue, EventExt, FunctionExt, JsonAbiExt, Specifier};
use alloy::json_abi::{Event, Function, JsonAbi};
use alloy::primitives::{Bytes, Selector, B256, U256};
use alloy::rpc::types::Log;
use tracing::debug;

use crate::error::{BindError, BindResult};

/// Encoder/decoder over a parsed contract interface.
///
/// The interface is parsed once at bind time and never changes afterwards;
/// a different interface means a different gateway.
#[derive(Debug, Clone)]
pub struct AbiGateway {
    abi: JsonAbi,
}

impl AbiGateway {
    /// Parse a JSON interface description.
    ///
    /// Fails with [`BindError::MalformedAbi`] when the JSON is invalid or any
    /// function or event parameter names a type that cannot be resolved.
    pub fn parse(json: &str) -> BindResult<Self> {
        let abi: JsonAbi = serde_json::from_str(json)
            .map_err(|e| BindError::MalformedAbi(format!("invalid JSON: {}", e)))?;
        Self::from_abi(abi)
    }

    pub fn from_abi(abi: JsonAbi) -> BindResult<Self> {
        for function in abi.functions() {
            for param in function.inputs.iter().chain(function.outputs.iter()) {
                param.resolve().map_err(|e| {
                    BindError::MalformedAbi(format!(
                        "function '{}' parameter '{}' has unknown type '{}': {}",
                        function.name, param.name, param.ty, e
                    ))
                })?;
            }
        }

        for event in abi.events() {
            for param in &event.inputs {
                param.resolve().map_err(|e| {
                    BindError::MalformedAbi(format!(
                        "event '{}' parameter '{}' has unknown type '{}': {}",
                        event.name, param.name, param.ty, e
                    ))
                })?;
            }
        }

        debug!(
            functions = abi.functions().count(),
            events = abi.events().count(),
            "Parsed contract ABI"
        );
        Ok(Self { abi })
    }

    pub fn abi(&self) -> &JsonAbi {
        &self.abi
    }

    /// Look up a function by name. Overloads are disambiguated by argument
    /// count; with `None` the first declared overload is returned.
    pub fn function(&self, name: &str, arg_count: Option<usize>) -> BindResult<&Function> {
        let overloads = self
            .abi
            .function(name)
            .filter(|o| !o.is_empty())
            .ok_or_else(|| BindError::UnknownMethod(name.to_string()))?;

        let (Some(count), [_, _, ..]) = (arg_count, overloads.as_slice()) else {
            return overloads
                .first()
                .ok_or_else(|| BindError::UnknownMethod(name.to_string()));
        };

        overloads
            .iter()
            .find(|f| f.inputs.len() == count)
            .ok_or_else(|| {
                let arities: Vec<String> = overloads
                    .iter()
                    .map(|f| f.inputs.len().to_string())
                    .collect();
                BindError::encode(
                    name,
                    format!(
                        "no overload takes {} arguments (overloads take {})",
                        count,
                        arities.join(", ")
                    ),
                )
            })
    }

    pub fn event(&self, name: &str) -> BindResult<&Event> {
        self.abi
            .event(name)
            .and_then(|o| o.first())
            .ok_or_else(|| BindError::UnknownEvent(name.to_string()))
    }

    pub fn selector(&self, method: &str) -> BindResult<Selector> {
        Ok(self.function(method, None)?.selector())
    }

    /// Topic 0 of a non-anonymous event.
    pub fn event_topic(&self, event: &str) -> BindResult<B256> {
        Ok(self.event(event)?.selector())
    }

    /// Encode a method call (selector followed by the ABI-encoded arguments).
    pub fn encode(&self, method: &str, args: &[DynSolValue]) -> BindResult<Bytes> {
        let function = self.function(method, Some(args.len()))?;

        if function.inputs.len() != args.len() {
            let expected: Vec<String> = function
                .inputs
                .iter()
                .map(|input| format!("{} {}", input.ty, input.name))
                .collect();
            return Err(BindError::encode(
                method,
                format!(
                    "expected {} arguments [{}], got {}",
                    function.inputs.len(),
                    expected.join(", "),
                    args.len()
                ),
            ));
        }

        let encoded = function
            .abi_encode_input(args)
            .map_err(|e| BindError::encode(method, e))?;
        Ok(encoded.into())
    }

    /// Decode the return data of a method into its declared outputs.
    ///
    /// `arg_count` picks the same overload [`encode`](Self::encode) used for
    /// the call.
    pub fn decode_result(
        &self,
        method: &str,
        arg_count: usize,
        data: &[u8],
    ) -> BindResult<Vec<DynSolValue>> {
        let function = self.function(method, Some(arg_count))?;
        function
            .abi_decode_output(data, true)
            .map_err(|e| BindError::decode(method, e))
    }

    /// Decode a log record into the event's fields in declaration order,
    /// merging indexed topics and the data section back together.
    pub fn decode_log(&self, event_name: &str, log: &Log) -> BindResult<Vec<DynSolValue>> {
        let event = self.event(event_name)?;
        let decoded = event
            .decode_log(log.data(), true)
            .map_err(|e| BindError::decode(event_name, e))?;

        let mut indexed = decoded.indexed.into_iter();
        let mut body = decoded.body.into_iter();
        event
            .inputs
            .iter()
            .map(|param| {
                let next = if param.indexed {
                    indexed.next()
                } else {
                    body.next()
                };
                next.ok_or_else(|| {
                    BindError::decode(event_name, format!("missing field '{}'", param.name))
                })
            })
            .collect()
    }
}

/// Sequential reader over decoded values, used by typed facades to build
/// return structs and events.
#[derive(Debug)]
pub struct Tokens {
    name: String,
    values: std::vec::IntoIter<DynSolValue>,
    position: usize,
}

impl Tokens {
    pub fn new(name: impl Into<String>, values: Vec<DynSolValue>) -> Self {
        Self {
            name: name.into(),
            values: values.into_iter(),
            position: 0,
        }
    }

    fn next_value(&mut self, expected: &str) -> BindResult<DynSolValue> {
        let position = self.position;
        self.position += 1;
        self.values.next().ok_or_else(|| {
            BindError::decode(
                self.name.clone(),
                format!("missing {} at position {}", expected, position),
            )
        })
    }

    fn mismatch(&self, expected: &str, got: &DynSolValue) -> BindError {
        BindError::decode(
            self.name.clone(),
            format!(
                "expected {} at position {}, got {:?}",
                expected,
                self.position - 1,
                got.as_type()
            ),
        )
    }

    pub fn bool(&mut self) -> BindResult<bool> {
        match self.next_value("bool")? {
            DynSolValue::Bool(b) => Ok(b),
            other => Err(self.mismatch("bool", &other)),
        }
    }

    pub fn b256(&mut self) -> BindResult<B256> {
        match self.next_value("bytes32")? {
            DynSolValue::FixedBytes(word, 32) => Ok(word),
            other => Err(self.mismatch("bytes32", &other)),
        }
    }

    pub fn uint(&mut self) -> BindResult<U256> {
        match self.next_value("uint")? {
            DynSolValue::Uint(value, _) => Ok(value),
            other => Err(self.mismatch("uint", &other)),
        }
    }

    /// Fails if values remain that the caller did not consume.
    pub fn finish(mut self) -> BindResult<()> {
        match self.values.next() {
            None => Ok(()),
            Some(extra) => Err(BindError::decode(
                self.name,
                format!("unexpected trailing value {:?}", extra.as_type()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testimonium::TESTIMONIUM_ABI;
    use alloy::primitives::{Address, LogData};

    fn gateway() -> AbiGateway {
        AbiGateway::parse(TESTIMONIUM_ABI).unwrap()
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        let err = AbiGateway::parse("[{\"type\": ").unwrap_err();
        assert!(matches!(err, BindError::MalformedAbi(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_types() {
        let abi = r#"[{"type":"function","name":"f","inputs":[{"name":"x","type":"notatype"}],"outputs":[],"stateMutability":"view"}]"#;
        let err = AbiGateway::parse(abi).unwrap_err();
        assert!(matches!(err, BindError::MalformedAbi(_)));
    }

    #[test]
    fn test_unknown_method_and_event() {
        let gateway = gateway();
        assert_eq!(
            gateway.encode("nope", &[]).unwrap_err(),
            BindError::UnknownMethod("nope".to_string())
        );
        assert!(matches!(
            gateway.event_topic("Nope"),
            Err(BindError::UnknownEvent(_))
        ));
    }

    #[test]
    fn test_encode_prefixes_selector() {
        let gateway = gateway();
        let hash = B256::repeat_byte(0x11);
        let encoded = gateway
            .encode("isBlock", &[DynSolValue::FixedBytes(hash, 32)])
            .unwrap();

        assert_eq!(encoded.len(), 4 + 32);
        assert_eq!(&encoded[..4], gateway.selector("isBlock").unwrap().as_slice());
        assert_eq!(&encoded[4..], hash.as_slice());
    }

    #[test]
    fn test_encode_argument_count_mismatch() {
        let err = gateway().encode("isBlock", &[]).unwrap_err();
        assert!(matches!(err, BindError::Encode { .. }));
    }

    #[test]
    fn test_decode_result_round_trip() {
        let gateway = gateway();
        let values = vec![
            DynSolValue::FixedBytes(B256::repeat_byte(0xAA), 32),
            DynSolValue::Uint(U256::from(1u64), 256),
            DynSolValue::Uint(U256::from(2u64), 256),
            DynSolValue::Uint(U256::from(3u64), 256),
            DynSolValue::Uint(U256::from(4u64), 256),
            DynSolValue::Uint(U256::from(5u64), 256),
            DynSolValue::FixedBytes(B256::repeat_byte(0xBB), 32),
        ];
        let response = DynSolValue::Tuple(values.clone()).abi_encode_params();

        assert_eq!(gateway.decode_result("getBlock", 1, &response).unwrap(), values);
    }

    #[test]
    fn test_decode_result_rejects_short_data() {
        let err = gateway().decode_result("isBlock", 1, &[0u8; 7]).unwrap_err();
        assert!(matches!(err, BindError::Decode { .. }));
    }

    const OVERLOADED_ABI: &str = r#"[
        {"type":"function","name":"f","stateMutability":"view",
         "inputs":[{"name":"a","type":"uint256"}],
         "outputs":[{"name":"","type":"bool"}]},
        {"type":"function","name":"f","stateMutability":"view",
         "inputs":[{"name":"a","type":"uint256"},{"name":"b","type":"uint256"}],
         "outputs":[{"name":"x","type":"uint256"},{"name":"y","type":"uint256"}]}
    ]"#;

    #[test]
    fn test_overloaded_method_decodes_with_matching_outputs() {
        let gateway = AbiGateway::parse(OVERLOADED_ABI).unwrap();
        let args = [
            DynSolValue::Uint(U256::from(1u64), 256),
            DynSolValue::Uint(U256::from(2u64), 256),
        ];
        let encoded = gateway.encode("f", &args).unwrap();
        let two_args = gateway.function("f", Some(2)).unwrap();
        assert_eq!(&encoded[..4], two_args.selector().as_slice());

        let outputs = vec![
            DynSolValue::Uint(U256::from(7u64), 256),
            DynSolValue::Uint(U256::from(9u64), 256),
        ];
        let response = DynSolValue::Tuple(outputs.clone()).abi_encode_params();
        assert_eq!(gateway.decode_result("f", args.len(), &response).unwrap(), outputs);

        let response = DynSolValue::Tuple(vec![DynSolValue::Bool(true)]).abi_encode_params();
        assert_eq!(
            gateway.decode_result("f", 1, &response).unwrap(),
            vec![DynSolValue::Bool(true)]
        );
    }

    #[test]
    fn test_overloaded_method_rejects_unmatched_arity() {
        let gateway = AbiGateway::parse(OVERLOADED_ABI).unwrap();
        match gateway.encode("f", &[]).unwrap_err() {
            BindError::Encode { method, reason } => {
                assert_eq!(method, "f");
                assert!(reason.contains("overloads take 1, 2"), "{}", reason);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_decode_log_in_declaration_order() {
        let gateway = gateway();
        let fields = vec![
            DynSolValue::FixedBytes(B256::repeat_byte(0xAA), 32),
            DynSolValue::FixedBytes(B256::repeat_byte(0xCC), 32),
            DynSolValue::Uint(U256::from(5u64), 256),
            DynSolValue::FixedBytes(B256::repeat_byte(0xBB), 32),
        ];
        let data = DynSolValue::Tuple(fields.clone()).abi_encode_params();
        let topic = gateway.event_topic("SubmitBlockHeader").unwrap();

        let log = Log {
            inner: alloy::primitives::Log {
                address: Address::ZERO,
                data: LogData::new_unchecked(vec![topic], data.into()),
            },
            ..Default::default()
        };

        assert_eq!(gateway.decode_log("SubmitBlockHeader", &log).unwrap(), fields);
    }

    #[test]
    fn test_tokens_reports_type_mismatch() {
        let mut tokens = Tokens::new("isBlock", vec![DynSolValue::Uint(U256::from(1u64), 256)]);
        assert!(matches!(tokens.bool(), Err(BindError::Decode { .. })));
    }

    #[test]
    fn test_tokens_finish_rejects_trailing_values() {
        let tokens = Tokens::new("x", vec![DynSolValue::Bool(true)]);
        assert!(tokens.finish().is_err());

        let mut tokens = Tokens::new("x", vec![DynSolValue::Bool(true)]);
        assert!(tokens.bool().unwrap());
        assert!(tokens.finish().is_ok());
    }
}
