//! LibXML2 FFI wrapper
//!
//! Direct bindings to the parts of libxml2 the engine needs: document parsing
//! with XInclude, XML Schema compilation and validation, XPath 1.0, and the
//! external entity loader used for catalog resolution.
//!
//! ## Thread Safety Strategy
//!
//! - **Initialization**: guarded by `std::sync::Once`; libxml2's init functions are not thread-safe.
//! - **Schema parsing**: serialized through a process-wide mutex (the schema parser is not thread-safe).
//! - **Validation and XPath**: each call creates its own context, so different documents can be
//!   processed in parallel against a shared compiled schema.
//! - **Error capture**: libxml2 keeps the structured error handler in thread-local state, so an
//!   [`ErrorCapture`] guard only observes errors raised on its own thread.
//! - **Entity resolution**: the active [`EntityResolver`] is thread-local and scoped by
//!   [`ResolverScope`]; engines on different threads never see each other's catalogs.

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Once, OnceLock};

use libc::{c_char, c_int, c_uchar, c_void};

use crate::error::{LibXml2Error, LibXml2Result};

static LIBXML2_INIT: Once = Once::new();

/// Serializes `xmlSchemaParse` across the process
static SCHEMA_PARSE_LOCK: Mutex<()> = Mutex::new(());

// Parser options (xmlParserOption)
pub const XML_PARSE_DTDLOAD: c_int = 1 << 2;
pub const XML_PARSE_XINCLUDE: c_int = 1 << 10;
pub const XML_PARSE_NOBASEFIX: c_int = 1 << 18;
pub const XML_PARSE_HUGE: c_int = 1 << 19;

// xmlErrorLevel
const XML_ERR_WARNING: c_int = 1;
const XML_ERR_ERROR: c_int = 2;

// xmlXPathObjectType
const XPATH_NODESET: c_int = 1;

// Opaque libxml2 structures
#[repr(C)]
pub struct XmlSchema {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlSchemaValidCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlDoc {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlNode {
    _private: [u8; 0],
}

/// Leading fields of `struct _xmlNode`, stable across libxml2 releases
#[repr(C)]
struct XmlNodeHead {
    _private: *mut c_void,
    _node_type: c_int,
    name: *const c_uchar,
}

#[repr(C)]
pub struct XmlParserCtxt {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlParserInput {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlXPathContext {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlXPathCompExpr {
    _private: [u8; 0],
}

#[repr(C)]
pub struct XmlNodeSet {
    pub node_nr: c_int,
    pub node_max: c_int,
    pub node_tab: *mut *mut XmlNode,
}

#[repr(C)]
pub struct XmlXPathObject {
    pub object_type: c_int,
    pub nodesetval: *mut XmlNodeSet,
    pub boolval: c_int,
    pub floatval: f64,
    pub stringval: *mut c_uchar,
    pub user: *mut c_void,
    pub index: c_int,
    pub user2: *mut c_void,
    pub index2: c_int,
}

#[repr(C)]
pub struct xmlError {
    pub domain: c_int,
    pub code: c_int,
    pub message: *const c_char,
    pub level: c_int,
    pub file: *const c_char,
    pub line: c_int,
    pub str1: *const c_char,
    pub str2: *const c_char,
    pub str3: *const c_char,
    pub int1: c_int,
    pub int2: c_int,
    pub ctxt: *mut c_void,
    pub node: *mut c_void,
}

pub type XmlStructuredErrorFunc =
    Option<unsafe extern "C" fn(user_data: *mut c_void, error: *mut xmlError)>;

pub type XmlExternalEntityLoader = Option<
    unsafe extern "C" fn(
        url: *const c_char,
        id: *const c_char,
        ctxt: *mut XmlParserCtxt,
    ) -> *mut XmlParserInput,
>;

pub type XmlInputMatchCallback = Option<unsafe extern "C" fn(filename: *const c_char) -> c_int>;
pub type XmlInputOpenCallback = Option<unsafe extern "C" fn(filename: *const c_char) -> *mut c_void>;
pub type XmlInputReadCallback =
    Option<unsafe extern "C" fn(context: *mut c_void, buffer: *mut c_char, len: c_int) -> c_int>;
pub type XmlInputCloseCallback = Option<unsafe extern "C" fn(context: *mut c_void) -> c_int>;

#[cfg_attr(target_os = "windows", link(name = "libxml2"))]
#[cfg_attr(not(target_os = "windows"), link(name = "xml2"))]
unsafe extern "C" {
    pub fn xmlInitParser();
    pub fn xmlInitGlobals();

    pub static xmlFree: Option<unsafe extern "C" fn(ptr: *mut c_void)>;

    // Error handling
    pub fn xmlSetStructuredErrorFunc(ctx: *mut c_void, handler: XmlStructuredErrorFunc);
    pub fn xmlCtxtGetLastError(ctxt: *mut XmlParserCtxt) -> *const xmlError;

    // Document parsing
    pub fn xmlNewParserCtxt() -> *mut XmlParserCtxt;
    pub fn xmlFreeParserCtxt(ctxt: *mut XmlParserCtxt);
    pub fn xmlCtxtReadMemory(
        ctxt: *mut XmlParserCtxt,
        buffer: *const c_char,
        size: c_int,
        url: *const c_char,
        encoding: *const c_char,
        options: c_int,
    ) -> *mut XmlDoc;
    pub fn xmlFreeDoc(doc: *mut XmlDoc);
    pub fn xmlXIncludeProcessFlags(doc: *mut XmlDoc, flags: c_int) -> c_int;

    // Tree access
    pub fn xmlDocGetRootElement(doc: *const XmlDoc) -> *mut XmlNode;
    pub fn xmlGetNsProp(
        node: *const XmlNode,
        name: *const c_uchar,
        namespace: *const c_uchar,
    ) -> *mut c_uchar;
    pub fn xmlGetLineNo(node: *const XmlNode) -> libc::c_long;
    pub fn xmlGetNodePath(node: *const XmlNode) -> *mut c_uchar;
    pub fn xmlNodeGetContent(node: *const XmlNode) -> *mut c_uchar;
    pub fn xmlNodeGetBase(doc: *const XmlDoc, node: *const XmlNode) -> *mut c_uchar;

    // Schema parsing
    pub fn xmlSchemaNewParserCtxt(url: *const c_char) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaNewMemParserCtxt(
        buffer: *const c_char,
        size: c_int,
    ) -> *mut XmlSchemaParserCtxt;
    pub fn xmlSchemaSetParserStructuredErrors(
        ctxt: *mut XmlSchemaParserCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaParse(ctxt: *const XmlSchemaParserCtxt) -> *mut XmlSchema;
    pub fn xmlSchemaFreeParserCtxt(ctxt: *mut XmlSchemaParserCtxt);
    pub fn xmlSchemaFree(schema: *mut XmlSchema);

    // Schema validation
    pub fn xmlSchemaNewValidCtxt(schema: *const XmlSchema) -> *mut XmlSchemaValidCtxt;
    pub fn xmlSchemaFreeValidCtxt(ctxt: *mut XmlSchemaValidCtxt);
    pub fn xmlSchemaSetValidStructuredErrors(
        ctxt: *mut XmlSchemaValidCtxt,
        serror: XmlStructuredErrorFunc,
        ctx: *mut c_void,
    );
    pub fn xmlSchemaValidateDoc(ctxt: *mut XmlSchemaValidCtxt, doc: *mut XmlDoc) -> c_int;

    // XPath
    pub fn xmlXPathNewContext(doc: *mut XmlDoc) -> *mut XmlXPathContext;
    pub fn xmlXPathFreeContext(ctxt: *mut XmlXPathContext);
    pub fn xmlXPathRegisterNs(
        ctxt: *mut XmlXPathContext,
        prefix: *const c_uchar,
        ns_uri: *const c_uchar,
    ) -> c_int;
    pub fn xmlXPathRegisterVariable(
        ctxt: *mut XmlXPathContext,
        name: *const c_uchar,
        value: *mut XmlXPathObject,
    ) -> c_int;
    pub fn xmlXPathRegisteredVariablesCleanup(ctxt: *mut XmlXPathContext);
    pub fn xmlXPathSetContextNode(node: *mut XmlNode, ctxt: *mut XmlXPathContext) -> c_int;
    pub fn xmlXPathCompile(expr: *const c_uchar) -> *mut XmlXPathCompExpr;
    pub fn xmlXPathFreeCompExpr(comp: *mut XmlXPathCompExpr);
    pub fn xmlXPathCompiledEval(
        comp: *mut XmlXPathCompExpr,
        ctxt: *mut XmlXPathContext,
    ) -> *mut XmlXPathObject;
    pub fn xmlXPathFreeObject(obj: *mut XmlXPathObject);
    pub fn xmlXPathCastToBoolean(obj: *mut XmlXPathObject) -> c_int;
    pub fn xmlXPathCastToString(obj: *mut XmlXPathObject) -> *mut c_uchar;

    // Entity loading
    pub fn xmlSetExternalEntityLoader(f: XmlExternalEntityLoader);
    pub fn xmlGetExternalEntityLoader() -> XmlExternalEntityLoader;
    pub fn xmlRegisterInputCallbacks(
        match_fn: XmlInputMatchCallback,
        open_fn: XmlInputOpenCallback,
        read_fn: XmlInputReadCallback,
        close_fn: XmlInputCloseCallback,
    ) -> c_int;
}

/// Ensure libxml2 is initialized exactly once.
pub fn init() {
    LIBXML2_INIT.call_once(|| unsafe {
        xmlInitParser();
        xmlInitGlobals();
    });
}

/// Take ownership of a libxml2-allocated string.
///
/// # Safety
///
/// `ptr` must be null or a NUL-terminated string allocated by libxml2.
unsafe fn take_xml_string(ptr: *mut c_uchar) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    let value = unsafe { CStr::from_ptr(ptr as *const c_char) }
        .to_string_lossy()
        .into_owned();
    unsafe { free_xml(ptr as *mut c_void) };
    Some(value)
}

unsafe fn free_xml(ptr: *mut c_void) {
    if let Some(free) = unsafe { xmlFree } {
        unsafe { free(ptr) };
    }
}

fn to_cstring(value: &str) -> LibXml2Result<CString> {
    CString::new(value).map_err(|_| LibXml2Error::InvalidString {
        details: format!("interior NUL byte in '{}'", value.replace('\0', "\\0")),
    })
}

/// A message raised by libxml2 while parsing or validating
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlMessage {
    pub level: XmlMessageLevel,
    pub message: String,
    pub file: Option<String>,
    pub line: i32,
    pub column: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XmlMessageLevel {
    Warning,
    Error,
    Fatal,
}

impl XmlMessage {
    unsafe fn from_raw(error: *const xmlError) -> Option<Self> {
        if error.is_null() {
            return None;
        }
        let error = unsafe { &*error };
        let message = if error.message.is_null() {
            String::from("unknown libxml2 error")
        } else {
            unsafe { CStr::from_ptr(error.message) }
                .to_string_lossy()
                .trim()
                .to_string()
        };
        let file = if error.file.is_null() {
            None
        } else {
            Some(
                unsafe { CStr::from_ptr(error.file) }
                    .to_string_lossy()
                    .into_owned(),
            )
        };
        let level = match error.level {
            XML_ERR_WARNING => XmlMessageLevel::Warning,
            XML_ERR_ERROR => XmlMessageLevel::Error,
            _ => XmlMessageLevel::Fatal,
        };
        Some(XmlMessage {
            level,
            message,
            file,
            line: error.line,
            column: error.int2,
        })
    }

    pub fn is_warning(&self) -> bool {
        self.level == XmlMessageLevel::Warning
    }
}

/// Callback for libxml2 to report errors (structured)
unsafe extern "C" fn structured_error_callback(user_data: *mut c_void, error: *mut xmlError) {
    if user_data.is_null() {
        return;
    }
    let messages = unsafe { &mut *(user_data as *mut Vec<XmlMessage>) };
    if let Some(message) = unsafe { XmlMessage::from_raw(error) } {
        messages.push(message);
    }
}

/// Routes libxml2's thread-local structured error handler into a buffer
/// for as long as the guard lives.
pub struct ErrorCapture {
    messages: Box<Vec<XmlMessage>>,
}

impl ErrorCapture {
    pub fn start() -> Self {
        init();
        let mut messages: Box<Vec<XmlMessage>> = Box::default();
        let ptr = messages.as_mut() as *mut Vec<XmlMessage> as *mut c_void;
        unsafe { xmlSetStructuredErrorFunc(ptr, Some(structured_error_callback)) };
        ErrorCapture { messages }
    }

    /// Messages captured so far; the handler stays installed.
    pub fn take(&mut self) -> Vec<XmlMessage> {
        std::mem::take(self.messages.as_mut())
    }

    fn sink(&mut self) -> *mut c_void {
        self.messages.as_mut() as *mut Vec<XmlMessage> as *mut c_void
    }
}

impl Drop for ErrorCapture {
    fn drop(&mut self) {
        unsafe { xmlSetStructuredErrorFunc(std::ptr::null_mut(), None) };
    }
}

/// Thread-safe handle to a compiled libxml2 schema
#[derive(Debug, Clone)]
pub struct XmlSchemaPtr {
    inner: Arc<XmlSchemaInner>,
}

#[derive(Debug)]
struct XmlSchemaInner {
    ptr: *mut XmlSchema,
    _phantom: PhantomData<XmlSchema>,
}

// Safety: compiled xmlSchema structures are read-only after parsing and
// libxml2 documents them as safe to share between validation contexts.
unsafe impl Send for XmlSchemaInner {}
unsafe impl Sync for XmlSchemaInner {}

impl XmlSchemaPtr {
    unsafe fn from_raw(ptr: *mut XmlSchema, details: String) -> LibXml2Result<Self> {
        if ptr.is_null() {
            return Err(LibXml2Error::SchemaParseFailed { details });
        }

        Ok(XmlSchemaPtr {
            inner: Arc::new(XmlSchemaInner {
                ptr,
                _phantom: PhantomData,
            }),
        })
    }

    pub(crate) fn as_ptr(&self) -> *const XmlSchema {
        self.inner.ptr
    }

    /// Whether two handles share one compiled schema
    pub fn same_schema(&self, other: &XmlSchemaPtr) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Drop for XmlSchemaInner {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                xmlSchemaFree(self.ptr);
            }
            self.ptr = std::ptr::null_mut();
        }
    }
}

fn join_messages(messages: &[XmlMessage]) -> String {
    if messages.is_empty() {
        return String::from("no details reported by libxml2");
    }
    messages
        .iter()
        .filter(|m| !m.is_warning())
        .map(|m| m.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Parse a schema from a location (path or URL) so relative includes resolve.
pub fn parse_schema_from_location(location: &str) -> LibXml2Result<XmlSchemaPtr> {
    init();
    let c_location = to_cstring(location)?;
    let _guard = SCHEMA_PARSE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    unsafe {
        let parser_ctxt = xmlSchemaNewParserCtxt(c_location.as_ptr());
        if parser_ctxt.is_null() {
            return Err(LibXml2Error::MemoryAllocation);
        }
        parse_with_context(parser_ctxt)
    }
}

/// Parse a schema from an in-memory buffer.
pub fn parse_schema_from_memory(schema_data: &[u8]) -> LibXml2Result<XmlSchemaPtr> {
    init();
    let _guard = SCHEMA_PARSE_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());

    unsafe {
        let parser_ctxt = xmlSchemaNewMemParserCtxt(
            schema_data.as_ptr() as *const c_char,
            schema_data.len() as c_int,
        );
        if parser_ctxt.is_null() {
            return Err(LibXml2Error::MemoryAllocation);
        }
        parse_with_context(parser_ctxt)
    }
}

unsafe fn parse_with_context(parser_ctxt: *mut XmlSchemaParserCtxt) -> LibXml2Result<XmlSchemaPtr> {
    let mut capture = ErrorCapture::start();
    unsafe {
        xmlSchemaSetParserStructuredErrors(
            parser_ctxt,
            Some(structured_error_callback),
            capture.sink(),
        );
        let schema_ptr = xmlSchemaParse(parser_ctxt);
        xmlSchemaFreeParserCtxt(parser_ctxt);

        let messages = capture.take();
        XmlSchemaPtr::from_raw(schema_ptr, join_messages(&messages))
    }
}

/// Options applied when reading a document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseOptions {
    pub xinclude: bool,
    pub load_external_dtd: bool,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            xinclude: true,
            load_external_dtd: true,
        }
    }
}

impl ParseOptions {
    fn flags(&self) -> c_int {
        let mut flags = XML_PARSE_HUGE;
        if self.load_external_dtd {
            flags |= XML_PARSE_DTDLOAD;
        }
        if self.xinclude {
            flags |= XML_PARSE_XINCLUDE | XML_PARSE_NOBASEFIX;
        }
        flags
    }
}

/// Failure to read a document that is not well-formed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseFailure {
    pub line: i32,
    pub column: i32,
    pub message: String,
}

/// An owned libxml2 document tree
pub struct XmlDocument {
    ptr: *mut XmlDoc,
}

// Safety: the document is exclusively owned; libxml2 has no hidden shared
// state per document, so moving it to another thread is sound.
unsafe impl Send for XmlDocument {}

impl std::fmt::Debug for XmlDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XmlDocument").field("ptr", &self.ptr).finish()
    }
}

impl XmlDocument {
    /// Parse a document from memory.
    ///
    /// Returns the document together with non-fatal messages (XInclude
    /// problems, DTD warnings), or a [`ParseFailure`] if the input is not
    /// well-formed.
    pub fn parse(
        bytes: &[u8],
        base_uri: &str,
        options: ParseOptions,
    ) -> LibXml2Result<Result<(XmlDocument, Vec<XmlMessage>), ParseFailure>> {
        init();
        let c_base = to_cstring(base_uri)?;
        let mut capture = ErrorCapture::start();

        unsafe {
            let ctxt = xmlNewParserCtxt();
            if ctxt.is_null() {
                return Err(LibXml2Error::MemoryAllocation);
            }

            let doc = xmlCtxtReadMemory(
                ctxt,
                bytes.as_ptr() as *const c_char,
                bytes.len() as c_int,
                c_base.as_ptr(),
                std::ptr::null(),
                options.flags(),
            );

            if doc.is_null() {
                let messages = capture.take();
                let last = XmlMessage::from_raw(xmlCtxtGetLastError(ctxt));
                xmlFreeParserCtxt(ctxt);
                let failure = last
                    .or_else(|| messages.into_iter().rev().find(|m| !m.is_warning()))
                    .map(|m| ParseFailure {
                        line: m.line,
                        column: m.column,
                        message: m.message,
                    })
                    .unwrap_or(ParseFailure {
                        line: 0,
                        column: 0,
                        message: String::from("document is empty or unreadable"),
                    });
                return Ok(Err(failure));
            }
            xmlFreeParserCtxt(ctxt);

            let document = XmlDocument { ptr: doc };
            if options.xinclude {
                xmlXIncludeProcessFlags(doc, options.flags());
            }

            let messages = capture.take();
            Ok(Ok((document, messages)))
        }
    }

    /// Validate against a compiled schema, collecting every violation.
    pub fn validate(&self, schema: &XmlSchemaPtr) -> LibXml2Result<Vec<XmlMessage>> {
        let mut capture = ErrorCapture::start();
        unsafe {
            let valid_ctxt = xmlSchemaNewValidCtxt(schema.as_ptr());
            if valid_ctxt.is_null() {
                return Err(LibXml2Error::ValidationContextCreationFailed);
            }

            xmlSchemaSetValidStructuredErrors(
                valid_ctxt,
                Some(structured_error_callback),
                capture.sink(),
            );

            let result_code = xmlSchemaValidateDoc(valid_ctxt, self.ptr);
            xmlSchemaFreeValidCtxt(valid_ctxt);

            let messages = capture.take();
            if result_code < 0 && messages.is_empty() {
                return Err(LibXml2Error::ValidationContextCreationFailed);
            }
            Ok(messages)
        }
    }

    pub fn root(&self) -> Option<XmlNodeRef<'_>> {
        let ptr = unsafe { xmlDocGetRootElement(self.ptr) };
        (!ptr.is_null()).then_some(XmlNodeRef {
            ptr,
            doc: self,
        })
    }

    pub(crate) fn as_ptr(&self) -> *mut XmlDoc {
        self.ptr
    }
}

impl Drop for XmlDocument {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { xmlFreeDoc(self.ptr) };
            self.ptr = std::ptr::null_mut();
        }
    }
}

/// A node borrowed from an [`XmlDocument`]
#[derive(Clone, Copy)]
pub struct XmlNodeRef<'doc> {
    ptr: *mut XmlNode,
    doc: &'doc XmlDocument,
}

impl<'doc> XmlNodeRef<'doc> {
    /// Attribute value in the given namespace (`None` for no namespace)
    pub fn attribute_ns(&self, name: &str, namespace: Option<&str>) -> Option<String> {
        let c_name = to_cstring(name).ok()?;
        let c_ns = match namespace {
            Some(ns) => Some(to_cstring(ns).ok()?),
            None => None,
        };
        let ns_ptr = c_ns
            .as_ref()
            .map_or(std::ptr::null(), |ns| ns.as_ptr() as *const c_uchar);
        unsafe { take_xml_string(xmlGetNsProp(self.ptr, c_name.as_ptr() as *const c_uchar, ns_ptr)) }
    }

    /// Local name (element, attribute) or target (processing instruction)
    pub fn name(&self) -> Option<String> {
        let head = unsafe { &*(self.ptr as *const XmlNodeHead) };
        if head.name.is_null() {
            return None;
        }
        Some(
            unsafe { CStr::from_ptr(head.name as *const c_char) }
                .to_string_lossy()
                .into_owned(),
        )
    }

    pub fn line(&self) -> i64 {
        unsafe { xmlGetLineNo(self.ptr) as i64 }
    }

    /// XPath-like path of this node in its document
    pub fn path(&self) -> Option<String> {
        unsafe { take_xml_string(xmlGetNodePath(self.ptr)) }
    }

    pub fn content(&self) -> String {
        unsafe { take_xml_string(xmlNodeGetContent(self.ptr)) }.unwrap_or_default()
    }

    /// Effective base URI of this node
    pub fn base_uri(&self) -> Option<String> {
        unsafe { take_xml_string(xmlNodeGetBase(self.doc.ptr, self.ptr)) }
    }

    /// Identity of the underlying node, stable for the document's lifetime
    pub fn id(&self) -> usize {
        self.ptr as usize
    }

    pub(crate) fn as_ptr(&self) -> *mut XmlNode {
        self.ptr
    }
}

/// An XPath expression compiled once and evaluated many times
pub struct CompiledXPath {
    ptr: *mut XmlXPathCompExpr,
    expression: String,
}

// Safety: a compiled expression is immutable after compilation; evaluation
// state lives in the per-call xmlXPathContext.
unsafe impl Send for CompiledXPath {}
unsafe impl Sync for CompiledXPath {}

impl std::fmt::Debug for CompiledXPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CompiledXPath").field(&self.expression).finish()
    }
}

impl CompiledXPath {
    /// Compile an expression; prefixes are only checked at evaluation time.
    pub fn compile(expression: &str) -> LibXml2Result<Self> {
        init();
        let c_expr = to_cstring(expression)?;
        let mut capture = ErrorCapture::start();
        let ptr = unsafe { xmlXPathCompile(c_expr.as_ptr() as *const c_uchar) };
        let messages = capture.take();
        if ptr.is_null() {
            let detail = messages
                .first()
                .map(|m| format!("{}: {}", expression, m.message))
                .unwrap_or_else(|| expression.to_string());
            return Err(LibXml2Error::XPathCompilation { expression: detail });
        }
        Ok(CompiledXPath {
            ptr,
            expression: expression.to_string(),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl Drop for CompiledXPath {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { xmlXPathFreeCompExpr(self.ptr) };
            self.ptr = std::ptr::null_mut();
        }
    }
}

/// Owned XPath evaluation result
pub struct XPathValue {
    ptr: *mut XmlXPathObject,
}

impl XPathValue {
    pub fn to_boolean(&self) -> bool {
        unsafe { xmlXPathCastToBoolean(self.ptr) != 0 }
    }

    pub fn to_string_value(&self) -> String {
        unsafe { take_xml_string(xmlXPathCastToString(self.ptr)) }.unwrap_or_default()
    }

    /// Nodes of a node-set result, empty for other result types
    pub fn nodes<'doc>(&self, doc: &'doc XmlDocument) -> Vec<XmlNodeRef<'doc>> {
        unsafe {
            let obj = &*self.ptr;
            if obj.object_type != XPATH_NODESET || obj.nodesetval.is_null() {
                return Vec::new();
            }
            let set = &*obj.nodesetval;
            if set.node_tab.is_null() {
                return Vec::new();
            }
            (0..set.node_nr as usize)
                .map(|i| XmlNodeRef {
                    ptr: *set.node_tab.add(i),
                    doc,
                })
                .collect()
        }
    }

    /// Hand ownership to libxml2 (e.g. when registering a variable)
    fn into_raw(self) -> *mut XmlXPathObject {
        let ptr = self.ptr;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for XPathValue {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { xmlXPathFreeObject(self.ptr) };
        }
    }
}

/// Evaluation context bound to one document
pub struct XPathContext<'doc> {
    ptr: *mut XmlXPathContext,
    doc: &'doc XmlDocument,
}

impl<'doc> XPathContext<'doc> {
    pub fn new(doc: &'doc XmlDocument) -> LibXml2Result<Self> {
        let ptr = unsafe { xmlXPathNewContext(doc.as_ptr()) };
        if ptr.is_null() {
            return Err(LibXml2Error::MemoryAllocation);
        }
        Ok(XPathContext { ptr, doc })
    }

    pub fn register_namespace(&mut self, prefix: &str, uri: &str) -> LibXml2Result<()> {
        let c_prefix = to_cstring(prefix)?;
        let c_uri = to_cstring(uri)?;
        unsafe {
            xmlXPathRegisterNs(
                self.ptr,
                c_prefix.as_ptr() as *const c_uchar,
                c_uri.as_ptr() as *const c_uchar,
            );
        }
        Ok(())
    }

    /// Bind `$name` to a previously computed value.
    pub fn register_variable(&mut self, name: &str, value: XPathValue) -> LibXml2Result<()> {
        let c_name = to_cstring(name)?;
        unsafe {
            xmlXPathRegisterVariable(self.ptr, c_name.as_ptr() as *const c_uchar, value.into_raw());
        }
        Ok(())
    }

    pub fn clear_variables(&mut self) {
        unsafe { xmlXPathRegisteredVariablesCleanup(self.ptr) };
    }

    /// Evaluate with `node` as the context node; `None` means the document
    /// node, so relative paths start above the root element.
    pub fn evaluate(
        &mut self,
        expr: &CompiledXPath,
        node: Option<XmlNodeRef<'doc>>,
    ) -> LibXml2Result<XPathValue> {
        let node_ptr = node.map_or(self.doc.as_ptr() as *mut XmlNode, |n| n.as_ptr());
        let mut capture = ErrorCapture::start();
        let obj = unsafe {
            xmlXPathSetContextNode(node_ptr, self.ptr);
            xmlXPathCompiledEval(expr.ptr, self.ptr)
        };
        if obj.is_null() {
            let expression = match capture.take().first() {
                Some(m) => format!("{}: {}", expr.expression, m.message),
                None => expr.expression.clone(),
            };
            return Err(LibXml2Error::XPathEvaluation { expression });
        }
        Ok(XPathValue { ptr: obj })
    }

    pub fn document(&self) -> &'doc XmlDocument {
        self.doc
    }
}

impl Drop for XPathContext<'_> {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe { xmlXPathFreeContext(self.ptr) };
        }
    }
}

/// Redirects entity and schema loads performed by libxml2
pub trait EntityResolver: Send + Sync {
    /// Map a system identifier (and optional public identifier) to a new
    /// location, or `None` to keep the default resolution.
    fn resolve(&self, public_id: Option<&str>, system_id: Option<&str>) -> Option<String>;

    /// Bytes for an `http(s)` location, or `None` to let libxml2 try its own
    /// network support.
    fn fetch_remote(&self, _url: &str) -> Option<Vec<u8>> {
        None
    }
}

thread_local! {
    static ACTIVE_RESOLVER: RefCell<Option<Arc<dyn EntityResolver>>> = const { RefCell::new(None) };
}

static DEFAULT_LOADER: OnceLock<XmlExternalEntityLoader> = OnceLock::new();

unsafe extern "C" fn resolving_entity_loader(
    url: *const c_char,
    id: *const c_char,
    ctxt: *mut XmlParserCtxt,
) -> *mut XmlParserInput {
    let system_id = (!url.is_null()).then(|| unsafe { CStr::from_ptr(url) }.to_string_lossy().into_owned());
    let public_id = (!id.is_null()).then(|| unsafe { CStr::from_ptr(id) }.to_string_lossy().into_owned());

    let redirected = ACTIVE_RESOLVER.with(|active| {
        active
            .borrow()
            .as_ref()
            .and_then(|resolver| resolver.resolve(public_id.as_deref(), system_id.as_deref()))
    });

    let redirected = redirected.and_then(|location| CString::new(location).ok());
    let target = redirected.as_ref().map_or(url, |c| c.as_ptr());

    match DEFAULT_LOADER.get().copied().flatten() {
        Some(loader) => unsafe { loader(target, id, ctxt) },
        None => std::ptr::null_mut(),
    }
}

static REMOTE_CALLBACKS: Once = Once::new();

struct RemoteInput {
    data: Vec<u8>,
    position: usize,
}

fn is_http(filename: &str) -> bool {
    let lower = filename.get(..8).unwrap_or(filename).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

unsafe extern "C" fn remote_input_match(filename: *const c_char) -> c_int {
    if filename.is_null() {
        return 0;
    }
    let filename = unsafe { CStr::from_ptr(filename) }.to_string_lossy();
    let active = ACTIVE_RESOLVER.with(|active| active.borrow().is_some());
    c_int::from(active && is_http(&filename))
}

unsafe extern "C" fn remote_input_open(filename: *const c_char) -> *mut c_void {
    if filename.is_null() {
        return std::ptr::null_mut();
    }
    let url = unsafe { CStr::from_ptr(filename) }.to_string_lossy().into_owned();
    let data = ACTIVE_RESOLVER.with(|active| {
        active
            .borrow()
            .as_ref()
            .and_then(|resolver| resolver.fetch_remote(&url))
    });
    match data {
        Some(data) => Box::into_raw(Box::new(RemoteInput { data, position: 0 })) as *mut c_void,
        None => std::ptr::null_mut(),
    }
}

unsafe extern "C" fn remote_input_read(context: *mut c_void, buffer: *mut c_char, len: c_int) -> c_int {
    if context.is_null() || buffer.is_null() || len < 0 {
        return -1;
    }
    let input = unsafe { &mut *(context as *mut RemoteInput) };
    let remaining = &input.data[input.position..];
    let count = remaining.len().min(len as usize);
    unsafe { std::ptr::copy_nonoverlapping(remaining.as_ptr(), buffer as *mut u8, count) };
    input.position += count;
    count as c_int
}

unsafe extern "C" fn remote_input_close(context: *mut c_void) -> c_int {
    if !context.is_null() {
        drop(unsafe { Box::from_raw(context as *mut RemoteInput) });
    }
    0
}

/// Installs a resolver for libxml2 loads made on this thread while alive.
///
/// Besides redirecting entity loads, the resolver serves `http(s)` reads so
/// remote schema imports and XIncludes go through the caller's cache.
pub struct ResolverScope {
    previous: Option<Arc<dyn EntityResolver>>,
}

impl ResolverScope {
    pub fn enter(resolver: Arc<dyn EntityResolver>) -> Self {
        init();
        DEFAULT_LOADER.get_or_init(|| unsafe {
            let default_loader = xmlGetExternalEntityLoader();
            xmlSetExternalEntityLoader(Some(resolving_entity_loader));
            default_loader
        });
        REMOTE_CALLBACKS.call_once(|| unsafe {
            xmlRegisterInputCallbacks(
                Some(remote_input_match),
                Some(remote_input_open),
                Some(remote_input_read),
                Some(remote_input_close),
            );
        });
        let previous = ACTIVE_RESOLVER.with(|active| active.borrow_mut().replace(resolver));
        ResolverScope { previous }
    }
}

impl Drop for ResolverScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        ACTIVE_RESOLVER.with(|active| *active.borrow_mut() = previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_XSD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<xs:schema xmlns:xs="http://www.w3.org/2001/XMLSchema">
    <xs:element name="root" type="xs:string"/>
</xs:schema>"#;

    const VALID_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<root>Hello World</root>"#;

    const INVALID_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<root><invalid>content</invalid></root>"#;

    fn parse(xml: &str) -> XmlDocument {
        let (doc, _) = XmlDocument::parse(xml.as_bytes(), "memory.xml", ParseOptions::default())
            .unwrap()
            .unwrap();
        doc
    }

    #[test]
    fn test_schema_parsing_success() {
        let schema = parse_schema_from_memory(SIMPLE_XSD.as_bytes());
        assert!(schema.is_ok());
    }

    #[test]
    fn test_schema_parsing_invalid_schema() {
        let result = parse_schema_from_memory(b"<invalid>not a schema</invalid>");

        match result {
            Err(LibXml2Error::SchemaParseFailed { details }) => assert!(!details.is_empty()),
            Err(other) => panic!("Expected SchemaParseFailed, got {:?}", other),
            Ok(_) => panic!("Expected SchemaParseFailed"),
        }
    }

    #[test]
    fn test_validation_valid_and_invalid() {
        let schema = parse_schema_from_memory(SIMPLE_XSD.as_bytes()).unwrap();

        let valid = parse(VALID_XML);
        assert!(valid.validate(&schema).unwrap().is_empty());

        let invalid = parse(INVALID_XML);
        let messages = invalid.validate(&schema).unwrap();
        assert!(!messages.is_empty());
        assert_eq!(messages[0].line, 2);
    }

    #[test]
    fn test_malformed_document_reports_line() {
        let outcome = XmlDocument::parse(
            b"<root>\n<open></root>",
            "broken.xml",
            ParseOptions::default(),
        )
        .unwrap();

        match outcome {
            Err(failure) => {
                assert!(failure.line >= 2);
                assert!(!failure.message.is_empty());
            }
            Ok(_) => panic!("Expected a parse failure"),
        }
    }

    #[test]
    fn test_schema_ptr_cloning() {
        let schema = parse_schema_from_memory(SIMPLE_XSD.as_bytes()).unwrap();
        let cloned_schema = schema.clone();

        assert!(schema.same_schema(&cloned_schema));
        assert_eq!(schema.as_ptr(), cloned_schema.as_ptr());
    }

    #[test]
    fn test_xpath_evaluation() {
        let doc = parse(r#"<a xmlns="urn:x"><b n="1"/><b n="2"/></a>"#);
        let mut ctx = XPathContext::new(&doc).unwrap();
        ctx.register_namespace("x", "urn:x").unwrap();

        let count = CompiledXPath::compile("count(//x:b) = 2").unwrap();
        assert!(ctx.evaluate(&count, None).unwrap().to_boolean());

        let nodes = CompiledXPath::compile("//x:b").unwrap();
        let value = ctx.evaluate(&nodes, None).unwrap();
        let found = value.nodes(&doc);
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].attribute_ns("n", None).as_deref(), Some("2"));
        assert_eq!(found[1].name().as_deref(), Some("b"));
        assert!(found[0].path().unwrap().ends_with("[1]"));
    }

    #[test]
    fn test_xpath_variables() {
        let doc = parse("<a><b>7</b></a>");
        let mut ctx = XPathContext::new(&doc).unwrap();

        let select = CompiledXPath::compile("string(/a/b)").unwrap();
        let value = ctx.evaluate(&select, None).unwrap();
        ctx.register_variable("v", value).unwrap();

        let check = CompiledXPath::compile("$v = '7'").unwrap();
        assert!(ctx.evaluate(&check, None).unwrap().to_boolean());
        ctx.clear_variables();
    }

    #[test]
    fn test_xpath_compile_error() {
        match CompiledXPath::compile("@size >") {
            Err(LibXml2Error::XPathCompilation { expression }) => {
                assert!(expression.contains("@size >"))
            }
            other => panic!("Expected XPathCompilation, got {:?}", other.map(|_| ())),
        }
    }

    struct InMemoryRemote;

    impl EntityResolver for InMemoryRemote {
        fn resolve(&self, _public_id: Option<&str>, _system_id: Option<&str>) -> Option<String> {
            None
        }

        fn fetch_remote(&self, url: &str) -> Option<Vec<u8>> {
            (url == "http://schemas.invalid/simple.xsd").then(|| SIMPLE_XSD.as_bytes().to_vec())
        }
    }

    #[test]
    fn test_remote_schema_served_by_resolver() {
        let _scope = ResolverScope::enter(Arc::new(InMemoryRemote));
        let schema = parse_schema_from_location("http://schemas.invalid/simple.xsd").unwrap();
        assert!(parse(VALID_XML).validate(&schema).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_validation_shared_schema() {
        use rayon::prelude::*;

        let schema = parse_schema_from_memory(SIMPLE_XSD.as_bytes()).unwrap();

        let results: Vec<usize> = (0..10)
            .into_par_iter()
            .map(|i| {
                let xml = if i % 2 == 0 { VALID_XML } else { INVALID_XML };
                parse(xml).validate(&schema).unwrap().len()
            })
            .collect();

        assert_eq!(results.iter().filter(|&&n| n == 0).count(), 5);
    }
}
