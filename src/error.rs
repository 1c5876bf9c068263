// =============================================================================
// Venue error taxonomy — transient vs. fatal, with Binance code mapping
// =============================================================================
//
// Errors crossing the venue port are sum-typed, never free-form strings:
//   - Transient: rate limit, 5xx, timestamp skew, network fault. The retry
//     wrapper absorbs these; only terminal failure surfaces.
//   - Fatal: margin, notional, filter, auth, unknown order. Fail fast —
//     retrying cannot help.
// The string codes callers see (`venue:transient`, `venue:fatal`) are the
// externalized form produced by Display.
// =============================================================================

/// Classification of a deterministic venue rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalKind {
    /// Insufficient margin / balance for the requested order.
    Margin,
    /// Order notional below the symbol minimum.
    Notional,
    /// Price or quantity violates a symbol filter (tick size, bounds,
    /// stop too close to mark).
    Filter,
    /// Authentication / permission failure.
    Auth,
    /// The referenced order does not exist.
    UnknownOrder,
    /// Leverage outside the allowed bracket.
    Leverage,
    /// Venue rejected the order for another deterministic reason.
    Rejected,
}

impl FatalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Margin => "margin",
            Self::Notional => "notional",
            Self::Filter => "filter",
            Self::Auth => "auth",
            Self::UnknownOrder => "unknown_order",
            Self::Leverage => "leverage",
            Self::Rejected => "rejected",
        }
    }
}

/// An error returned by the venue port.
#[derive(Debug, Clone)]
pub enum VenueError {
    /// Retryable: rate limit, 5xx, timestamp skew, timeout, connection fault.
    Transient { reason: String },
    /// Deterministic: retrying the identical request cannot succeed.
    Fatal { kind: FatalKind, message: String },
}

impl VenueError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
        }
    }

    pub fn fatal(kind: FatalKind, message: impl Into<String>) -> Self {
        Self::Fatal {
            kind,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Map a reqwest-level failure (no venue response) into the taxonomy.
    /// Timeouts and connection faults are retryable; anything else is not.
    pub fn from_http(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::transient(format!("network: {err}"))
        } else {
            Self::fatal(FatalKind::Rejected, format!("http: {err}"))
        }
    }

    /// Map an HTTP status + Binance error body into the taxonomy.
    ///
    /// Notable codes carry fixed user-visible messages so that per-user
    /// results stay readable without consulting the venue docs.
    pub fn from_binance(status: u16, code: i64, venue_message: &str) -> Self {
        match code {
            // Transient: venue internals, rate limits, clock skew.
            -1000 | -1001 => Self::transient(format!("venue internal error {code}")),
            -1003 => Self::transient("rate limit exceeded, wait before retrying".to_string()),
            -1015 => Self::transient("too many new orders".to_string()),
            -1021 => Self::transient("request timestamp outside recvWindow".to_string()),

            // Fatal: deterministic rejections with fixed messages.
            -2019 => Self::fatal(
                FatalKind::Margin,
                "insufficient margin, add funds or close positions",
            ),
            -2010 | -4013 => Self::fatal(
                FatalKind::Margin,
                format!("order rejected: {venue_message}"),
            ),
            -4001 | -4061 | -4164 => Self::fatal(
                FatalKind::Notional,
                "order notional below the symbol minimum",
            ),
            -1013 | -4003 => Self::fatal(
                FatalKind::Filter,
                "quantity below the symbol minimum or off step size",
            ),
            -4131 => Self::fatal(
                FatalKind::Filter,
                "price not a multiple of tick size or out of bounds",
            ),
            -4046 => Self::fatal(
                FatalKind::Filter,
                "stop price too close to mark price, would trigger immediately",
            ),
            -4044 | -4045 => Self::fatal(
                FatalKind::Rejected,
                format!("close/reduce order rejected: {venue_message}"),
            ),
            -2011 => Self::fatal(
                FatalKind::Rejected,
                format!("cancel rejected: {venue_message}"),
            ),
            -2013 => Self::fatal(FatalKind::UnknownOrder, "order does not exist"),
            -1022 | -2014 | -2015 => Self::fatal(
                FatalKind::Auth,
                "invalid API key, signature, IP or permissions",
            ),
            -4028 => Self::fatal(FatalKind::Leverage, "leverage outside the allowed bracket"),

            // Unknown code: classify by HTTP status. 5xx and 429 are worth
            // retrying, 4xx is a deterministic rejection.
            _ if status >= 500 || status == 429 => {
                Self::transient(format!("venue {status}: [{code}] {venue_message}"))
            }
            _ => Self::fatal(
                FatalKind::Rejected,
                format!("venue {status}: [{code}] {venue_message}"),
            ),
        }
    }
}

impl std::fmt::Display for VenueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient { reason } => write!(f, "venue:transient: {reason}"),
            Self::Fatal { kind, message } => {
                write!(f, "venue:fatal:{}: {message}", kind.as_str())
            }
        }
    }
}

impl std::error::Error for VenueError {}
