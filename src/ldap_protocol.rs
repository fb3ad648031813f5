// LDAP v3 operations on top of the BER packet tree.
// Request encoders, the LDAPMessage envelope, and response/result decoding.

use crate::ber::{self, Class, Encoding, Packet, TAG_ENUMERATED, TAG_INTEGER, TAG_OCTET_STRING, TAG_SEQUENCE};
use crate::error::{LdapError, Result, RESULT_SUCCESS};
use crate::filter::compile_filter;
use tracing::warn;

// Application tags of RFC 4511 protocolOp CHOICE
pub const APP_BIND_REQUEST: u32 = 0;
pub const APP_BIND_RESPONSE: u32 = 1;
pub const APP_UNBIND_REQUEST: u32 = 2;
pub const APP_SEARCH_REQUEST: u32 = 3;
pub const APP_SEARCH_RESULT_ENTRY: u32 = 4;
pub const APP_SEARCH_RESULT_DONE: u32 = 5;
pub const APP_MODIFY_REQUEST: u32 = 6;
pub const APP_MODIFY_RESPONSE: u32 = 7;
pub const APP_ADD_REQUEST: u32 = 8;
pub const APP_ADD_RESPONSE: u32 = 9;
pub const APP_DEL_REQUEST: u32 = 10;
pub const APP_DEL_RESPONSE: u32 = 11;
pub const APP_MODIFY_DN_REQUEST: u32 = 12;
pub const APP_MODIFY_DN_RESPONSE: u32 = 13;
pub const APP_COMPARE_REQUEST: u32 = 14;
pub const APP_COMPARE_RESPONSE: u32 = 15;
pub const APP_ABANDON_REQUEST: u32 = 16;
pub const APP_SEARCH_RESULT_REFERENCE: u32 = 19;
pub const APP_EXTENDED_REQUEST: u32 = 23;
pub const APP_EXTENDED_RESPONSE: u32 = 24;
pub const APP_INTERMEDIATE_RESPONSE: u32 = 25;

/// Context [0] IMPLICIT SEQUENCE OF Control, trailing the protocolOp
const CONTEXT_CONTROLS: u32 = 0;
/// LDAPResult referral [3]
const CONTEXT_REFERRAL: u32 = 3;
/// BindResponse serverSaslCreds [7]
const CONTEXT_SASL_CREDS: u32 = 7;
/// ExtendedResponse responseName [10] / responseValue [11]
const CONTEXT_RESPONSE_NAME: u32 = 10;
const CONTEXT_RESPONSE_VALUE: u32 = 11;

pub const PROTOCOL_VERSION: i64 = 3;

/// RFC 4532 "Who am I?" extended operation
pub const WHO_AM_I_OID: &str = "1.3.6.1.4.1.4203.1.11.3";
/// RFC 4511 4.4.1 unsolicited Notice of Disconnection
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// Human readable protocolOp name for an application tag.
pub fn op_name(tag: u32) -> &'static str {
    match tag {
        APP_BIND_REQUEST => "Bind Request",
        APP_BIND_RESPONSE => "Bind Response",
        APP_UNBIND_REQUEST => "Unbind Request",
        APP_SEARCH_REQUEST => "Search Request",
        APP_SEARCH_RESULT_ENTRY => "Search Result Entry",
        APP_SEARCH_RESULT_DONE => "Search Result Done",
        APP_MODIFY_REQUEST => "Modify Request",
        APP_MODIFY_RESPONSE => "Modify Response",
        APP_ADD_REQUEST => "Add Request",
        APP_ADD_RESPONSE => "Add Response",
        APP_DEL_REQUEST => "Del Request",
        APP_DEL_RESPONSE => "Del Response",
        APP_MODIFY_DN_REQUEST => "Modify DN Request",
        APP_MODIFY_DN_RESPONSE => "Modify DN Response",
        APP_COMPARE_REQUEST => "Compare Request",
        APP_COMPARE_RESPONSE => "Compare Response",
        APP_ABANDON_REQUEST => "Abandon Request",
        APP_SEARCH_RESULT_REFERENCE => "Search Result Reference",
        APP_EXTENDED_REQUEST => "Extended Request",
        APP_EXTENDED_RESPONSE => "Extended Response",
        APP_INTERMEDIATE_RESPONSE => "Intermediate Response",
        _ => "Unknown Operation",
    }
}

// LDAP Control (request or response)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub control_type: String,
    pub criticality: bool,
    pub control_value: Option<Vec<u8>>,
}

impl Control {
    pub fn new(control_type: impl Into<String>) -> Self {
        Self {
            control_type: control_type.into(),
            criticality: false,
            control_value: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.criticality = true;
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.control_value = Some(value.into());
        self
    }

    /// Control ::= SEQUENCE { controlType, criticality DEFAULT FALSE, controlValue OPTIONAL }
    pub fn to_packet(&self) -> Packet {
        let mut packet = Packet::sequence("Control")
            .with_child(Packet::octet_string(&self.control_type, "Control Type"));
        if self.criticality {
            packet.append_child(Packet::boolean(true, "Criticality"));
        }
        if let Some(value) = &self.control_value {
            packet.append_child(Packet::octet_string(value, "Control Value"));
        }
        packet
    }

    pub fn from_packet(packet: &Packet) -> Result<Self> {
        let control_type = packet
            .child(0)
            .ok_or_else(|| LdapError::protocol("control without type"))?
            .as_string()?;
        let mut control = Control::new(control_type);
        for child in packet.children.iter().skip(1) {
            match (child.class, child.tag) {
                (Class::Universal, ber::TAG_BOOLEAN) => control.criticality = child.as_bool()?,
                (Class::Universal, TAG_OCTET_STRING) => control.control_value = Some(child.data.clone()),
                _ => {
                    return Err(LdapError::protocol(format!(
                        "unexpected element tag {} in control {}",
                        child.tag, control.control_type
                    )))
                }
            }
        }
        Ok(control)
    }
}

pub fn encode_controls(controls: &[Control]) -> Packet {
    let mut packet = Packet::constructed(Class::Context, CONTEXT_CONTROLS, "Controls");
    for control in controls {
        packet.append_child(control.to_packet());
    }
    packet
}

pub fn decode_controls(packet: &Packet) -> Result<Vec<Control>> {
    packet.children.iter().map(Control::from_packet).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

impl Attribute {
    pub fn new<V: AsRef<[u8]>>(attr_type: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            attr_type: attr_type.into(),
            attr_values: values.into_iter().map(|v| v.as_ref().to_vec()).collect(),
        }
    }

    /// PartialAttribute ::= SEQUENCE { type, vals SET OF value }
    fn to_packet(&self) -> Packet {
        let mut values = Packet::set("Attribute Values");
        for value in &self.attr_values {
            values.append_child(Packet::octet_string(value, "Value"));
        }
        Packet::sequence("Attribute")
            .with_child(Packet::octet_string(&self.attr_type, "Type"))
            .with_child(values)
    }

    fn from_packet(packet: &Packet) -> Result<Self> {
        let attr_type = packet
            .child(0)
            .ok_or_else(|| LdapError::protocol("attribute without type"))?
            .as_string()?;
        let values = packet
            .child(1)
            .ok_or_else(|| LdapError::protocol(format!("attribute {} without value set", attr_type)))?;
        Ok(Self {
            attr_type,
            attr_values: values.children.iter().map(|v| v.data.clone()).collect(),
        })
    }
}

/// A typed request that can be framed into an LDAPMessage.
pub trait LdapOperation {
    /// Validate and build the protocolOp packet.
    fn to_packet(&self) -> Result<Packet>;

    /// Application tag of the final response, `None` when the server does not answer.
    fn response_tag(&self) -> Option<u32>;

    fn controls(&self) -> &[Control];

    fn name(&self) -> &'static str;
}

macro_rules! with_controls {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl $ty {
                pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
                    self.controls = controls;
                    self
                }
            }
        )+
    };
}

fn require_non_empty(value: &str, what: &str, op: &str) -> Result<()> {
    if value.is_empty() {
        return Err(LdapError::InvalidRequest(format!("{}: {} must not be empty", op, what)));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub version: i64,
    pub name: String,
    pub authentication: BindAuthentication,
    pub allow_empty_password: bool,
    pub controls: Vec<Control>,
}

impl BindRequest {
    pub fn simple(name: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            name: name.into(),
            authentication: BindAuthentication::Simple(password.into()),
            allow_empty_password: false,
            controls: Vec::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self::simple("", "")
    }

    /// Unauthenticated bind (RFC 4513 5.1.2): a name with an empty password.
    pub fn unauthenticated(name: impl Into<String>) -> Self {
        Self {
            allow_empty_password: true,
            ..Self::simple(name, "")
        }
    }

    pub fn sasl(mechanism: impl Into<String>, credentials: Option<Vec<u8>>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            name: String::new(),
            authentication: BindAuthentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
            allow_empty_password: false,
            controls: Vec::new(),
        }
    }
}

impl LdapOperation for BindRequest {
    fn to_packet(&self) -> Result<Packet> {
        let auth = match &self.authentication {
            BindAuthentication::Simple(password) => {
                if password.is_empty() && !self.name.is_empty() && !self.allow_empty_password {
                    return Err(LdapError::EmptyPassword(self.name.clone()));
                }
                Packet::context_primitive(0, password, "Password")
            }
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            } => {
                require_non_empty(mechanism, "SASL mechanism", self.name())?;
                let mut sasl = Packet::constructed(Class::Context, 3, "SASL Credentials")
                    .with_child(Packet::octet_string(mechanism, "Mechanism"));
                if let Some(credentials) = credentials {
                    sasl.append_child(Packet::octet_string(credentials, "Credentials"));
                }
                sasl
            }
        };
        Ok(Packet::application(APP_BIND_REQUEST, "Bind Request")
            .with_child(Packet::integer(self.version, "Version"))
            .with_child(Packet::octet_string(&self.name, "User Name"))
            .with_child(auth))
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_BIND_RESPONSE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "bind"
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnbindRequest {
    pub controls: Vec<Control>,
}

impl LdapOperation for UnbindRequest {
    fn to_packet(&self) -> Result<Packet> {
        Ok(Packet::new(Class::Application, Encoding::Primitive, APP_UNBIND_REQUEST, "Unbind Request"))
    }

    fn response_tag(&self) -> Option<u32> {
        None
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "unbind"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = LdapError;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::InvalidRequest(format!("invalid search scope: {}", value))),
        }
    }
}

impl std::str::FromStr for SearchScope {
    type Err = LdapError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "base" => Ok(SearchScope::BaseObject),
            "one" | "onelevel" => Ok(SearchScope::SingleLevel),
            "sub" | "subtree" => Ok(SearchScope::WholeSubtree),
            _ => Err(LdapError::InvalidRequest(format!("invalid search scope: {}", s))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: String,
    pub attributes: Vec<String>,
    pub controls: Vec<Control>,
}

impl SearchRequest {
    pub fn new(base_object: impl Into<String>, scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            base_object: base_object.into(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: filter.into(),
            attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn with_attributes<S: Into<String>>(mut self, attributes: impl IntoIterator<Item = S>) -> Self {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

impl LdapOperation for SearchRequest {
    fn to_packet(&self) -> Result<Packet> {
        if self.size_limit < 0 || self.time_limit < 0 {
            return Err(LdapError::InvalidRequest(format!(
                "search: negative limit (size {}, time {})",
                self.size_limit, self.time_limit
            )));
        }
        let filter = compile_filter(&self.filter)?;
        let mut attributes = Packet::sequence("Attributes");
        for attr in &self.attributes {
            attributes.append_child(Packet::octet_string(attr, "Attribute"));
        }
        Ok(Packet::application(APP_SEARCH_REQUEST, "Search Request")
            .with_child(Packet::octet_string(&self.base_object, "Base DN"))
            .with_child(Packet::enumerated(self.scope as i64, "Scope"))
            .with_child(Packet::enumerated(self.deref_aliases as i64, "Deref Aliases"))
            .with_child(Packet::integer(self.size_limit as i64, "Size Limit"))
            .with_child(Packet::integer(self.time_limit as i64, "Time Limit"))
            .with_child(Packet::boolean(self.types_only, "Types Only"))
            .with_child(filter)
            .with_child(attributes))
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_SEARCH_RESULT_DONE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "search"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
}

#[derive(Debug, Clone)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

/// Changes are kept per kind and always encoded adds first, then deletes, then replaces.
#[derive(Debug, Clone)]
pub struct ModifyRequest {
    pub object: String,
    pub add_attributes: Vec<Attribute>,
    pub delete_attributes: Vec<Attribute>,
    pub replace_attributes: Vec<Attribute>,
    pub controls: Vec<Control>,
}

impl ModifyRequest {
    pub fn new(object: impl Into<String>) -> Self {
        Self {
            object: object.into(),
            add_attributes: Vec::new(),
            delete_attributes: Vec::new(),
            replace_attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn add<V: AsRef<[u8]>>(mut self, attr: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.add_attributes.push(Attribute::new(attr, values));
        self
    }

    pub fn delete<V: AsRef<[u8]>>(mut self, attr: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.delete_attributes.push(Attribute::new(attr, values));
        self
    }

    pub fn replace<V: AsRef<[u8]>>(mut self, attr: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.replace_attributes.push(Attribute::new(attr, values));
        self
    }

    pub fn changes(&self) -> Vec<ModifyChange> {
        let tagged = |operation: ModifyOperation, attrs: &[Attribute]| {
            attrs
                .iter()
                .map(|a| ModifyChange {
                    operation,
                    modification: a.clone(),
                })
                .collect::<Vec<_>>()
        };
        let mut changes = tagged(ModifyOperation::Add, &self.add_attributes);
        changes.extend(tagged(ModifyOperation::Delete, &self.delete_attributes));
        changes.extend(tagged(ModifyOperation::Replace, &self.replace_attributes));
        changes
    }
}

impl LdapOperation for ModifyRequest {
    fn to_packet(&self) -> Result<Packet> {
        require_non_empty(&self.object, "DN", self.name())?;
        let mut changes = Packet::sequence("Changes");
        for change in self.changes() {
            changes.append_child(
                Packet::sequence("Change")
                    .with_child(Packet::enumerated(change.operation as i64, "Operation"))
                    .with_child(change.modification.to_packet()),
            );
        }
        Ok(Packet::application(APP_MODIFY_REQUEST, "Modify Request")
            .with_child(Packet::octet_string(&self.object, "DN"))
            .with_child(changes))
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_MODIFY_RESPONSE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "modify"
    }
}

#[derive(Debug, Clone)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
    pub controls: Vec<Control>,
}

impl AddRequest {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            attributes: Vec::new(),
            controls: Vec::new(),
        }
    }

    pub fn attribute<V: AsRef<[u8]>>(mut self, attr: impl Into<String>, values: impl IntoIterator<Item = V>) -> Self {
        self.attributes.push(Attribute::new(attr, values));
        self
    }
}

impl LdapOperation for AddRequest {
    fn to_packet(&self) -> Result<Packet> {
        require_non_empty(&self.entry, "DN", self.name())?;
        let mut attributes = Packet::sequence("Attributes");
        for attr in &self.attributes {
            require_non_empty(&attr.attr_type, "attribute type", self.name())?;
            if attr.attr_values.is_empty() {
                return Err(LdapError::InvalidRequest(format!(
                    "add: attribute {} has no values",
                    attr.attr_type
                )));
            }
            attributes.append_child(attr.to_packet());
        }
        Ok(Packet::application(APP_ADD_REQUEST, "Add Request")
            .with_child(Packet::octet_string(&self.entry, "DN"))
            .with_child(attributes))
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_ADD_RESPONSE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "add"
    }
}

#[derive(Debug, Clone)]
pub struct DelRequest {
    pub entry: String,
    pub controls: Vec<Control>,
}

impl DelRequest {
    pub fn new(entry: impl Into<String>) -> Self {
        Self {
            entry: entry.into(),
            controls: Vec::new(),
        }
    }
}

impl LdapOperation for DelRequest {
    // DelRequest ::= [APPLICATION 10] LDAPDN, primitive with the DN as content
    fn to_packet(&self) -> Result<Packet> {
        require_non_empty(&self.entry, "DN", self.name())?;
        Ok(Packet::primitive(Class::Application, APP_DEL_REQUEST, &self.entry, "Del Request"))
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_DEL_RESPONSE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "delete"
    }
}

#[derive(Debug, Clone)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
    pub controls: Vec<Control>,
}

impl ModifyDnRequest {
    pub fn new(entry: impl Into<String>, new_rdn: impl Into<String>, delete_old_rdn: bool) -> Self {
        Self {
            entry: entry.into(),
            new_rdn: new_rdn.into(),
            delete_old_rdn,
            new_superior: None,
            controls: Vec::new(),
        }
    }

    pub fn new_superior(mut self, superior: impl Into<String>) -> Self {
        self.new_superior = Some(superior.into());
        self
    }
}

impl LdapOperation for ModifyDnRequest {
    fn to_packet(&self) -> Result<Packet> {
        require_non_empty(&self.entry, "DN", self.name())?;
        require_non_empty(&self.new_rdn, "new RDN", self.name())?;
        let mut packet = Packet::application(APP_MODIFY_DN_REQUEST, "Modify DN Request")
            .with_child(Packet::octet_string(&self.entry, "DN"))
            .with_child(Packet::octet_string(&self.new_rdn, "New RDN"))
            .with_child(Packet::boolean(self.delete_old_rdn, "Delete Old RDN"));
        if let Some(superior) = &self.new_superior {
            packet.append_child(Packet::context_primitive(0, superior, "New Superior"));
        }
        Ok(packet)
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_MODIFY_DN_RESPONSE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "modify_dn"
    }
}

#[derive(Debug, Clone)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
    pub controls: Vec<Control>,
}

impl CompareRequest {
    pub fn new(entry: impl Into<String>, attr: impl Into<String>, value: impl AsRef<[u8]>) -> Self {
        Self {
            entry: entry.into(),
            attr: attr.into(),
            assertion_value: value.as_ref().to_vec(),
            controls: Vec::new(),
        }
    }
}

impl LdapOperation for CompareRequest {
    fn to_packet(&self) -> Result<Packet> {
        require_non_empty(&self.entry, "DN", self.name())?;
        require_non_empty(&self.attr, "attribute", self.name())?;
        let ava = Packet::sequence("AttributeValueAssertion")
            .with_child(Packet::octet_string(&self.attr, "Attribute"))
            .with_child(Packet::octet_string(&self.assertion_value, "Value"));
        Ok(Packet::application(APP_COMPARE_REQUEST, "Compare Request")
            .with_child(Packet::octet_string(&self.entry, "DN"))
            .with_child(ava))
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_COMPARE_RESPONSE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "compare"
    }
}

#[derive(Debug, Clone)]
pub struct AbandonRequest {
    pub message_id: i32,
    pub controls: Vec<Control>,
}

impl AbandonRequest {
    pub fn new(message_id: i32) -> Self {
        Self {
            message_id,
            controls: Vec::new(),
        }
    }
}

impl LdapOperation for AbandonRequest {
    fn to_packet(&self) -> Result<Packet> {
        if self.message_id <= 0 {
            return Err(LdapError::InvalidRequest(format!(
                "abandon: invalid message ID {}",
                self.message_id
            )));
        }
        Ok(Packet::primitive(
            Class::Application,
            APP_ABANDON_REQUEST,
            ber::encode_integer(self.message_id as i64),
            "Abandon Request",
        ))
    }

    fn response_tag(&self) -> Option<u32> {
        None
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "abandon"
    }
}

#[derive(Debug, Clone)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
    pub controls: Vec<Control>,
}

impl ExtendedRequest {
    pub fn new(request_name: impl Into<String>, request_value: Option<Vec<u8>>) -> Self {
        Self {
            request_name: request_name.into(),
            request_value,
            controls: Vec::new(),
        }
    }

    pub fn who_am_i() -> Self {
        Self::new(WHO_AM_I_OID, None)
    }
}

impl LdapOperation for ExtendedRequest {
    fn to_packet(&self) -> Result<Packet> {
        require_non_empty(&self.request_name, "request name", self.name())?;
        let mut packet = Packet::application(APP_EXTENDED_REQUEST, "Extended Request")
            .with_child(Packet::context_primitive(0, &self.request_name, "Request Name"));
        if let Some(value) = &self.request_value {
            packet.append_child(Packet::context_primitive(1, value, "Request Value"));
        }
        Ok(packet)
    }

    fn response_tag(&self) -> Option<u32> {
        Some(APP_EXTENDED_RESPONSE)
    }

    fn controls(&self) -> &[Control] {
        &self.controls
    }

    fn name(&self) -> &'static str {
        "extended"
    }
}

with_controls!(
    BindRequest,
    UnbindRequest,
    SearchRequest,
    ModifyRequest,
    AddRequest,
    DelRequest,
    ModifyDnRequest,
    CompareRequest,
    AbandonRequest,
    ExtendedRequest,
);

/// LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
pub fn envelope(message_id: i32, op: Packet, controls: &[Control]) -> Packet {
    let mut packet = Packet::sequence("LDAP Request")
        .with_child(Packet::integer(message_id as i64, "MessageID"))
        .with_child(op);
    if !controls.is_empty() {
        packet.append_child(encode_controls(controls));
    }
    packet
}

/// Message ID of a decoded LDAPMessage.
pub fn message_id(message: &Packet) -> Result<i32> {
    if !message.is(Class::Universal, TAG_SEQUENCE) {
        return Err(LdapError::protocol("LDAPMessage is not a SEQUENCE"));
    }
    let id = message
        .child(0)
        .filter(|c| c.is(Class::Universal, TAG_INTEGER))
        .ok_or_else(|| LdapError::protocol("LDAPMessage without message ID"))?
        .as_integer()?;
    i32::try_from(id)
        .ok()
        .filter(|id| *id >= 0)
        .ok_or_else(|| LdapError::protocol(format!("message ID {} out of range", id)))
}

/// The protocolOp of an LDAPMessage.
pub fn response_op(message: &Packet) -> Result<&Packet> {
    message
        .child(1)
        .filter(|op| op.class == Class::Application)
        .ok_or_else(|| LdapError::protocol("LDAPMessage without application protocolOp"))
}

/// Response controls from the optional `[0]` trailer.
pub fn response_controls(message: &Packet) -> Result<Vec<Control>> {
    match message.child(2) {
        Some(c) if c.is(Class::Context, CONTEXT_CONTROLS) && c.is_constructed() => decode_controls(c),
        Some(c) => Err(LdapError::protocol(format!(
            "unexpected trailer {:?}({}) in LDAPMessage",
            c.class, c.tag
        ))),
        None => Ok(Vec::new()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: u32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
    pub controls: Vec<Control>,
}

impl LdapResult {
    pub fn is_success(&self) -> bool {
        self.result_code == RESULT_SUCCESS
    }

    /// Nonzero result codes become `LdapError::Result`.
    pub fn success(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(self.into_error())
    }

    pub fn into_error(self) -> LdapError {
        LdapError::Result {
            code: self.result_code,
            matched_dn: self.matched_dn,
            diagnostic: self.diagnostic_message,
        }
    }
}

/// LDAPResult ::= SEQUENCE { resultCode ENUMERATED, matchedDN, diagnosticMessage, referral [3] OPTIONAL }
/// Operation-specific trailing elements are ignored.
fn parse_ldap_result(op: &Packet) -> Result<LdapResult> {
    if !op.is_constructed() || op.children.len() < 3 {
        return Err(LdapError::protocol(format!(
            "{} is not an LDAPResult",
            op_name(op.tag)
        )));
    }
    let code = &op.children[0];
    if code.class != Class::Universal || !(code.tag == TAG_ENUMERATED || code.tag == TAG_INTEGER) {
        return Err(LdapError::protocol("result code is not ENUMERATED"));
    }
    let result_code = u32::try_from(code.as_integer()?)
        .map_err(|_| LdapError::protocol("negative result code"))?;
    let mut referrals = Vec::new();
    if let Some(referral) = op
        .children
        .iter()
        .skip(3)
        .find(|c| c.is(Class::Context, CONTEXT_REFERRAL))
    {
        for uri in &referral.children {
            referrals.push(uri.as_string()?);
        }
    }
    Ok(LdapResult {
        result_code,
        matched_dn: op.children[1].as_string()?,
        diagnostic_message: op.children[2].as_string()?,
        referrals,
        controls: Vec::new(),
    })
}

/// Extract the LDAPResult of a response message.
///
/// On a tag mismatch, strict mode fails with `UnexpectedResponse`; lenient mode
/// logs and still reads the result if the op has LDAPResult shape.
pub fn decode_result(message: &Packet, expected_tag: u32, strict: bool) -> Result<LdapResult> {
    let op = response_op(message)?;
    let mut result = if op.tag == expected_tag {
        parse_ldap_result(op)?
    } else {
        let unexpected = LdapError::UnexpectedResponse {
            expected: expected_tag,
            actual: op.tag,
        };
        if strict {
            return Err(unexpected);
        }
        warn!(
            "Unexpected response: expected {}, got {}",
            op_name(expected_tag),
            op_name(op.tag)
        );
        parse_ldap_result(op).map_err(|_| unexpected)?
    };
    result.controls = response_controls(message)?;
    Ok(result)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

pub fn decode_bind_response(message: &Packet, strict: bool) -> Result<BindResponse> {
    let result = decode_result(message, APP_BIND_RESPONSE, strict)?;
    let server_sasl_creds = response_op(message)?
        .children
        .iter()
        .skip(3)
        .find(|c| c.is(Class::Context, CONTEXT_SASL_CREDS))
        .map(|c| c.data.clone());
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

impl ExtendedResponse {
    pub fn from_message(message: &Packet, strict: bool) -> Result<Self> {
        let result = decode_result(message, APP_EXTENDED_RESPONSE, strict)?;
        let mut response = ExtendedResponse {
            result,
            response_name: None,
            response_value: None,
        };
        for child in response_op(message)?.children.iter().skip(3) {
            match (child.class, child.tag) {
                (Class::Context, CONTEXT_RESPONSE_NAME) => response.response_name = Some(child.as_string()?),
                (Class::Context, CONTEXT_RESPONSE_VALUE) => response.response_value = Some(child.data.clone()),
                _ => {}
            }
        }
        Ok(response)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attrs: Vec<Attribute>,
}

impl SearchEntry {
    /// SearchResultEntry ::= [APPLICATION 4] SEQUENCE { objectName, attributes PartialAttributeList }
    pub fn from_op(op: &Packet) -> Result<Self> {
        if !op.is(Class::Application, APP_SEARCH_RESULT_ENTRY) {
            return Err(LdapError::protocol(format!("{} is not a search entry", op_name(op.tag))));
        }
        let dn = op
            .child(0)
            .ok_or_else(|| LdapError::protocol("search entry without DN"))?
            .as_string()?;
        let attrs = match op.child(1) {
            Some(list) => list
                .children
                .iter()
                .map(Attribute::from_packet)
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };
        Ok(Self { dn, attrs })
    }

    fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.attr_type.eq_ignore_ascii_case(name))
    }

    /// Values of `name` as UTF-8 text (lossy), empty if absent.
    pub fn values(&self, name: &str) -> Vec<String> {
        self.attribute(name)
            .map(|a| {
                a.attr_values
                    .iter()
                    .map(|v| String::from_utf8_lossy(v).into_owned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn bin_values(&self, name: &str) -> Vec<Vec<u8>> {
        self.attribute(name).map(|a| a.attr_values.clone()).unwrap_or_default()
    }
}

/// URIs of a SearchResultReference.
pub fn decode_search_reference(op: &Packet) -> Result<Vec<String>> {
    if !op.is(Class::Application, APP_SEARCH_RESULT_REFERENCE) {
        return Err(LdapError::protocol(format!("{} is not a search reference", op_name(op.tag))));
    }
    op.children.iter().map(Packet::as_string).collect()
}

#[derive(Debug, Clone, Default)]
pub struct SearchResult {
    pub entries: Vec<SearchEntry>,
    pub referrals: Vec<String>,
    pub result: LdapResult,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::{RESULT_NO_SUCH_OBJECT, RESULT_REFERRAL};

    /// LDAPMessage carrying an LDAPResult-shaped protocolOp.
    pub(crate) fn result_message(id: i32, tag: u32, code: i64, matched: &str, diag: &str) -> Packet {
        let op = Packet::application(tag, op_name(tag))
            .with_child(Packet::enumerated(code, "Result Code"))
            .with_child(Packet::octet_string(matched, "Matched DN"))
            .with_child(Packet::octet_string(diag, "Diagnostic"));
        envelope(id, op, &[])
    }

    #[test]
    fn test_search_scope_try_from() {
        assert_eq!(SearchScope::try_from(0).unwrap(), SearchScope::BaseObject);
        assert_eq!(SearchScope::try_from(1).unwrap(), SearchScope::SingleLevel);
        assert_eq!(SearchScope::try_from(2).unwrap(), SearchScope::WholeSubtree);
        assert!(SearchScope::try_from(3).is_err());
        assert_eq!("sub".parse::<SearchScope>().unwrap(), SearchScope::WholeSubtree);
        assert!("deep".parse::<SearchScope>().is_err());
    }

    #[test]
    fn test_del_request_is_primitive_dn() {
        let op = DelRequest::new("uid=test").to_packet().unwrap();
        assert_eq!(op.serialize(), [&[0x4A, 0x08][..], b"uid=test"].concat());
        let msg = envelope(3, op, &[]);
        let bytes = msg.serialize();
        assert_eq!(&bytes[..5], &[0x30, 0x0D, 0x02, 0x01, 0x03]);
    }

    #[test]
    fn test_del_request_requires_dn() {
        let err = DelRequest::new("").to_packet().unwrap_err();
        assert!(matches!(err, LdapError::InvalidRequest(_)));
    }

    #[test]
    fn test_modify_single_add() {
        let req = ModifyRequest::new("uid=test,dc=example,dc=com").add("mail", ["a@x.com"]);
        let msg = envelope(1, req.to_packet().unwrap(), req.controls());
        let decoded = ber::decode(&msg.serialize()).unwrap();
        let op = &decoded.children[1];
        assert!(op.is(Class::Application, APP_MODIFY_REQUEST));
        assert_eq!(op.children[0].as_bytes(), b"uid=test,dc=example,dc=com");
        let changes = &op.children[1];
        assert_eq!(changes.children.len(), 1);
        let change = &changes.children[0];
        assert_eq!(change.children[0].as_integer().unwrap(), 0);
        let attr = &change.children[1];
        assert_eq!(attr.children[0].as_bytes(), b"mail");
        assert_eq!(attr.children[1].children.len(), 1);
        assert_eq!(attr.children[1].children[0].as_bytes(), b"a@x.com");
    }

    #[test]
    fn test_modify_orders_add_delete_replace() {
        let req = ModifyRequest::new("cn=x")
            .replace("sn", ["r"])
            .delete("description", Vec::<&str>::new())
            .add("mail", ["a"])
            .add("cn", ["b"]);
        let op = req.to_packet().unwrap();
        let summary: Vec<(i64, Vec<u8>)> = op.children[1]
            .children
            .iter()
            .map(|c| (c.children[0].as_integer().unwrap(), c.children[1].children[0].data.clone()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, b"mail".to_vec()),
                (0, b"cn".to_vec()),
                (1, b"description".to_vec()),
                (2, b"sn".to_vec()),
            ]
        );
    }

    #[test]
    fn test_modify_empty_is_legal() {
        let op = ModifyRequest::new("cn=x").to_packet().unwrap();
        assert_eq!(op.children.len(), 2);
        assert!(op.children[1].children.is_empty());
        assert!(ModifyRequest::new("").to_packet().is_err());
    }

    #[test]
    fn test_add_request() {
        let req = AddRequest::new("cn=new,dc=example")
            .attribute("objectClass", ["top", "person"])
            .attribute("sn", ["New"]);
        let op = req.to_packet().unwrap();
        assert!(op.is(Class::Application, APP_ADD_REQUEST));
        assert_eq!(op.children[1].children.len(), 2);
        assert_eq!(op.children[1].children[0].children[1].children.len(), 2);

        let empty = AddRequest::new("cn=new").attribute("sn", Vec::<&str>::new());
        assert!(matches!(empty.to_packet(), Err(LdapError::InvalidRequest(_))));
    }

    #[test]
    fn test_simple_bind_encoding() {
        let op = BindRequest::simple("cn=admin", "secret").to_packet().unwrap();
        let bytes = op.serialize();
        assert_eq!(bytes[0], 0x60);
        let decoded = ber::decode(&bytes).unwrap();
        assert_eq!(decoded.children[0].as_integer().unwrap(), 3);
        assert_eq!(decoded.children[1].as_bytes(), b"cn=admin");
        assert!(decoded.children[2].is(Class::Context, 0));
        assert_eq!(decoded.children[2].as_bytes(), b"secret");
    }

    #[test]
    fn test_empty_password_guard() {
        let err = BindRequest::simple("cn=admin", "").to_packet().unwrap_err();
        assert!(matches!(err, LdapError::EmptyPassword(ref dn) if dn == "cn=admin"));
        assert!(BindRequest::unauthenticated("cn=admin").to_packet().is_ok());
        assert!(BindRequest::anonymous().to_packet().is_ok());
    }

    #[test]
    fn test_sasl_bind_encoding() {
        let op = BindRequest::sasl("EXTERNAL", None).to_packet().unwrap();
        let sasl = &op.children[2];
        assert!(sasl.is(Class::Context, 3));
        assert!(sasl.is_constructed());
        assert_eq!(sasl.children.len(), 1);
        assert_eq!(sasl.children[0].as_bytes(), b"EXTERNAL");
    }

    #[test]
    fn test_search_request_layout() {
        let req = SearchRequest::new("dc=example,dc=com", SearchScope::WholeSubtree, "(uid=alice)")
            .with_attributes(["cn", "mail"]);
        let op = req.to_packet().unwrap();
        assert_eq!(op.children.len(), 8);
        assert_eq!(op.children[1].as_integer().unwrap(), 2);
        assert_eq!(op.children[6].tag, crate::filter::FILTER_EQUALITY);
        assert_eq!(op.children[7].children.len(), 2);

        let bad = SearchRequest::new("dc=x", SearchScope::BaseObject, "(uid=alice");
        assert!(matches!(bad.to_packet(), Err(LdapError::FilterCompile(_))));
    }

    #[test]
    fn test_modify_dn_and_compare() {
        let op = ModifyDnRequest::new("cn=a,dc=x", "cn=b", true)
            .new_superior("ou=people,dc=x")
            .to_packet()
            .unwrap();
        assert_eq!(op.children.len(), 4);
        assert!(op.children[3].is(Class::Context, 0));
        assert!(!op.children[3].is_constructed());
        assert!(ModifyDnRequest::new("cn=a", "", false).to_packet().is_err());

        let op = CompareRequest::new("cn=a", "sn", "smith").to_packet().unwrap();
        assert!(op.is(Class::Application, APP_COMPARE_REQUEST));
        assert_eq!(op.children[1].children[0].as_bytes(), b"sn");
        assert!(CompareRequest::new("cn=a", "", "x").to_packet().is_err());
    }

    #[test]
    fn test_abandon_unbind_extended() {
        let op = AbandonRequest::new(300).to_packet().unwrap();
        assert_eq!(op.serialize(), vec![0x50, 0x02, 0x01, 0x2C]);
        assert!(AbandonRequest::new(0).to_packet().is_err());
        assert_eq!(UnbindRequest::default().to_packet().unwrap().serialize(), vec![0x42, 0x00]);
        assert_eq!(UnbindRequest::default().response_tag(), None);

        let op = ExtendedRequest::who_am_i().to_packet().unwrap();
        assert_eq!(op.children.len(), 1);
        assert_eq!(op.children[0].as_bytes(), WHO_AM_I_OID.as_bytes());
        assert!(ExtendedRequest::new("", None).to_packet().is_err());
    }

    #[test]
    fn test_controls_in_envelope() {
        let controls = vec![
            Control::new("1.2.840.113556.1.4.805").critical(),
            Control::new("1.3.6.1.4.1.42.2.27.8.5.1").with_value(vec![0x30, 0x00]),
        ];
        let req = DelRequest::new("cn=a").with_controls(controls.clone());
        let msg = envelope(9, req.to_packet().unwrap(), req.controls());
        let decoded = ber::decode(&msg.serialize()).unwrap();
        assert_eq!(decoded.children.len(), 3);
        // criticality FALSE is omitted
        assert_eq!(decoded.children[2].children[1].children.len(), 2);
        assert_eq!(response_controls(&decoded).unwrap(), controls);
    }

    #[test]
    fn test_decode_result_success_and_error() {
        let ok = result_message(1, APP_DEL_RESPONSE, 0, "", "");
        let result = decode_result(&ok, APP_DEL_RESPONSE, true).unwrap();
        assert!(result.is_success());
        assert!(result.success().is_ok());

        let missing = result_message(2, APP_DEL_RESPONSE, 32, "dc=example,dc=com", "no such object");
        let err = decode_result(&missing, APP_DEL_RESPONSE, true)
            .unwrap()
            .success()
            .unwrap_err();
        assert_eq!(
            err,
            LdapError::Result {
                code: RESULT_NO_SUCH_OBJECT,
                matched_dn: "dc=example,dc=com".to_string(),
                diagnostic: "no such object".to_string(),
            }
        );
    }

    #[test]
    fn test_decode_result_referrals() {
        let op = Packet::application(APP_MODIFY_RESPONSE, "Modify Response")
            .with_child(Packet::enumerated(RESULT_REFERRAL as i64, ""))
            .with_child(Packet::octet_string("", ""))
            .with_child(Packet::octet_string("", ""))
            .with_child(
                Packet::constructed(Class::Context, 3, "Referral")
                    .with_child(Packet::octet_string("ldap://other/dc=x", "")),
            );
        let msg = ber::decode(&envelope(4, op, &[]).serialize()).unwrap();
        let result = decode_result(&msg, APP_MODIFY_RESPONSE, true).unwrap();
        assert_eq!(result.result_code, RESULT_REFERRAL);
        assert_eq!(result.referrals, vec!["ldap://other/dc=x".to_string()]);
    }

    #[test]
    fn test_decode_result_tag_mismatch() {
        let msg = result_message(5, APP_MODIFY_RESPONSE, 0, "", "");
        let err = decode_result(&msg, APP_DEL_RESPONSE, true).unwrap_err();
        assert_eq!(
            err,
            LdapError::UnexpectedResponse {
                expected: APP_DEL_RESPONSE,
                actual: APP_MODIFY_RESPONSE
            }
        );
        // lenient mode reads the result anyway
        let result = decode_result(&msg, APP_DEL_RESPONSE, false).unwrap();
        assert!(result.is_success());

        // lenient, but the op is not an LDAPResult
        let entry = envelope(
            5,
            Packet::application(APP_SEARCH_RESULT_ENTRY, "")
                .with_child(Packet::octet_string("cn=a", ""))
                .with_child(Packet::sequence("")),
            &[],
        );
        assert!(matches!(
            decode_result(&entry, APP_DEL_RESPONSE, false),
            Err(LdapError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn test_decode_result_malformed() {
        let msg = envelope(
            6,
            Packet::application(APP_DEL_RESPONSE, "").with_child(Packet::enumerated(0, "")),
            &[],
        );
        assert!(matches!(
            decode_result(&msg, APP_DEL_RESPONSE, true),
            Err(LdapError::Protocol(_))
        ));
    }

    #[test]
    fn test_message_id() {
        let msg = result_message(77, APP_DEL_RESPONSE, 0, "", "");
        assert_eq!(message_id(&msg).unwrap(), 77);
        assert!(message_id(&Packet::octet_string("x", "")).is_err());
    }

    #[test]
    fn test_search_entry_and_reference() {
        let attrs = Packet::sequence("")
            .with_child(Attribute::new("mail", ["a@x.com", "b@x.com"]).to_packet())
            .with_child(Attribute::new("cn", ["Alice"]).to_packet());
        let op = Packet::application(APP_SEARCH_RESULT_ENTRY, "")
            .with_child(Packet::octet_string("uid=alice,dc=x", ""))
            .with_child(attrs);
        let entry = SearchEntry::from_op(&op).unwrap();
        assert_eq!(entry.dn, "uid=alice,dc=x");
        assert_eq!(entry.values("MAIL"), vec!["a@x.com", "b@x.com"]);
        assert!(entry.values("sn").is_empty());
        assert_eq!(entry.bin_values("cn"), vec![b"Alice".to_vec()]);

        let reference = Packet::application(APP_SEARCH_RESULT_REFERENCE, "")
            .with_child(Packet::octet_string("ldap://b/dc=x", ""));
        assert_eq!(decode_search_reference(&reference).unwrap(), vec!["ldap://b/dc=x"]);
    }

    #[test]
    fn test_extended_response() {
        let op = Packet::application(APP_EXTENDED_RESPONSE, "")
            .with_child(Packet::enumerated(0, ""))
            .with_child(Packet::octet_string("", ""))
            .with_child(Packet::octet_string("", ""))
            .with_child(Packet::context_primitive(11, "dn:cn=admin", ""));
        let msg = ber::decode(&envelope(8, op, &[]).serialize()).unwrap();
        let resp = ExtendedResponse::from_message(&msg, true).unwrap();
        assert_eq!(resp.response_name, None);
        assert_eq!(resp.response_value.as_deref(), Some(&b"dn:cn=admin"[..]));
    }

    #[test]
    fn test_bind_response_sasl_creds() {
        let op = Packet::application(APP_BIND_RESPONSE, "")
            .with_child(Packet::enumerated(14, ""))
            .with_child(Packet::octet_string("", ""))
            .with_child(Packet::octet_string("", ""))
            .with_child(Packet::context_primitive(7, b"challenge", ""));
        let msg = envelope(2, op, &[]);
        let resp = decode_bind_response(&msg, true).unwrap();
        assert_eq!(resp.result.result_code, 14);
        assert_eq!(resp.server_sasl_creds.as_deref(), Some(&b"challenge"[..]));
    }
}
