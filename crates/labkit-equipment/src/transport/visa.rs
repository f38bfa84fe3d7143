/*!
 * VISA-style message-based sessions and the helpers drivers use on them.
 */
use std::fmt::Debug;

use async_trait::async_trait;

use crate::equipment::Identification;
use crate::error::{TransportError, TransportResult};

/// A VISA-style message-based instrument session
#[async_trait]
pub trait VisaSession: Send + Debug {
    /// Query the instrument identification string (`*IDN?`)
    async fn identify(&mut self) -> TransportResult<String>;

    /// Send a command that produces no response
    async fn write(&mut self, command: &str) -> TransportResult<()>;

    /// Send a command and read back the response line
    async fn query(&mut self, command: &str) -> TransportResult<String>;

    /// Request an instrument-level reset
    async fn reset(&mut self) -> TransportResult<()>;

    /// Clear the status registers and error queue
    async fn clear_faults(&mut self) -> TransportResult<()>;

    /// Run the built-in self-test, returning whether it passed
    async fn self_test(&mut self) -> TransportResult<bool>;

    /// Release the session
    async fn close(&mut self) -> TransportResult<()>;
}

/// Send `command` and parse the response as a number
pub async fn query_f64(session: &mut dyn VisaSession, command: &str) -> TransportResult<f64> {
    let response = session.query(command).await?;
    response
        .trim()
        .parse::<f64>()
        .map_err(|_| TransportError::Protocol(format!("'{}' answered '{}'", command, response.trim())))
}

/// Split an `*IDN?` response (`maker,model,serial,firmware`) into its fields.
///
/// Missing trailing fields are reported as `Unknown`; an empty response is a
/// protocol error.
pub fn parse_identification(idn: &str) -> TransportResult<Identification> {
    let idn = idn.trim();
    if idn.is_empty() {
        return Err(TransportError::Protocol("empty identification".to_string()));
    }

    let mut fields = idn.split(',').map(str::trim);
    let mut next = || {
        fields
            .next()
            .filter(|f| !f.is_empty())
            .unwrap_or("Unknown")
            .to_string()
    };

    Ok(Identification {
        manufacturer: next(),
        model: next(),
        serial_number: next(),
        firmware: next(),
    })
}

/// Render a boolean the way SCPI expects it
pub fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "ON"
    } else {
        "OFF"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_identification() {
        let ident =
            parse_identification("Agilent Technologies,34461A,MY53200123,A.02.14-02.40\n").unwrap();
        assert_eq!(ident.manufacturer, "Agilent Technologies");
        assert_eq!(ident.model, "34461A");
        assert_eq!(ident.serial_number, "MY53200123");
        assert_eq!(ident.firmware, "A.02.14-02.40");
    }

    #[test]
    fn test_parse_short_identification() {
        let ident = parse_identification("ACME,X1").unwrap();
        assert_eq!(ident.model, "X1");
        assert_eq!(ident.serial_number, "Unknown");
        assert_eq!(ident.firmware, "Unknown");

        assert!(parse_identification("  ").is_err());
    }

    #[test]
    fn test_on_off() {
        assert_eq!(on_off(true), "ON");
        assert_eq!(on_off(false), "OFF");
    }
}
