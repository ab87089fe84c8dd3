//! Collaborators the order workflows consume but do not own: customers, catalog,
//! payment methods and document generation. In-memory versions back tests and dev setups.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use ordercore_core::{
    AddressId, CustomerId, DocumentId, ErrorKind, Money, OrderId, PaymentMethodId, ProductId,
    StaffId, VariantId,
};
use ordercore_sales::{Order, PaymentMethod};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExternalError {
    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    #[error("{0}")]
    Rejected(String),
}

impl ExternalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExternalError::Unavailable { .. } => ErrorKind::Infrastructure,
            ExternalError::Rejected(_) => ErrorKind::Validation,
        }
    }

    fn poisoned(service: &'static str) -> Self {
        ExternalError::Unavailable {
            service,
            reason: "lock poisoned".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub id: AddressId,
    pub customer_id: CustomerId,
    pub recipient_name: String,
    pub address_line1: String,
    pub address_line2: String,
    pub city: String,
    pub state: String,
    pub postal_code: String,
    pub country: String,
    pub is_default: bool,
}

pub trait CustomerDirectory: Send + Sync {
    fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, ExternalError>;

    fn find_addresses_by_customer_id(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Address>, ExternalError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogVariant {
    pub id: VariantId,
    pub sku: String,
    pub name: String,
    pub price: Money,
    /// Zero means no special price.
    pub special_price: Money,
}

impl CatalogVariant {
    pub fn current_price(&self) -> &Money {
        if self.special_price.is_zero() {
            &self.price
        } else {
            &self.special_price
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProduct {
    pub id: ProductId,
    pub sku: String,
    pub name: String,
    pub price: Money,
    /// Zero means no special price.
    pub special_price: Money,
    pub special_price_start: Option<DateTime<Utc>>,
    pub special_price_end: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub variants: Vec<CatalogVariant>,
}

impl CatalogProduct {
    /// Active, non-discounted product priced at `price`.
    pub fn new(id: ProductId, sku: impl Into<String>, name: impl Into<String>, price: Money) -> Self {
        Self {
            id,
            sku: sku.into(),
            name: name.into(),
            special_price: price.zeroed(),
            price,
            special_price_start: None,
            special_price_end: None,
            is_active: true,
            variants: Vec::new(),
        }
    }

    pub fn with_special_price(
        mut self,
        special_price: Money,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        self.special_price = special_price;
        self.special_price_start = start;
        self.special_price_end = end;
        self
    }

    pub fn with_variant(mut self, variant: CatalogVariant) -> Self {
        self.variants.push(variant);
        self
    }

    /// The special price applies when it is non-zero and `now` lies inside its
    /// optional `[start, end]` window.
    pub fn current_price(&self, now: DateTime<Utc>) -> &Money {
        if self.special_price.is_zero() {
            return &self.price;
        }
        let started = self.special_price_start.is_none_or(|start| now >= start);
        let not_ended = self.special_price_end.is_none_or(|end| now <= end);
        if started && not_ended {
            &self.special_price
        } else {
            &self.price
        }
    }

    pub fn variant(&self, id: VariantId) -> Option<&CatalogVariant> {
        self.variants.iter().find(|v| v.id == id)
    }
}

pub trait Catalog: Send + Sync {
    fn find_product(&self, id: ProductId) -> Result<Option<CatalogProduct>, ExternalError>;
}

pub trait PaymentMethodDirectory: Send + Sync {
    fn find_by_id(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>, ExternalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    Receipt,
    ShippingLabel,
    TaxInvoice,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub order_id: OrderId,
    pub document_type: DocumentType,
    pub document_number: String,
    pub file_path: String,
    pub generated_by: Option<StaffId>,
    pub created_at: DateTime<Utc>,
}

pub trait DocumentGenerator: Send + Sync {
    fn generate(
        &self,
        order: &Order,
        document_type: DocumentType,
        staff_id: Option<StaffId>,
    ) -> Result<Document, ExternalError>;
}

#[derive(Debug, Default)]
pub struct InMemoryCustomerDirectory {
    customers: RwLock<HashMap<CustomerId, Customer>>,
    addresses: RwLock<Vec<Address>>,
}

impl InMemoryCustomerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_customer(&self, customer: Customer) -> Result<(), ExternalError> {
        let mut customers = self
            .customers
            .write()
            .map_err(|_| ExternalError::poisoned("customers"))?;
        customers.insert(customer.id, customer);
        Ok(())
    }

    pub fn insert_address(&self, address: Address) -> Result<(), ExternalError> {
        let mut addresses = self
            .addresses
            .write()
            .map_err(|_| ExternalError::poisoned("customers"))?;
        addresses.push(address);
        Ok(())
    }
}

impl CustomerDirectory for InMemoryCustomerDirectory {
    fn find_by_id(&self, id: CustomerId) -> Result<Option<Customer>, ExternalError> {
        let customers = self
            .customers
            .read()
            .map_err(|_| ExternalError::poisoned("customers"))?;
        Ok(customers.get(&id).cloned())
    }

    fn find_addresses_by_customer_id(
        &self,
        customer_id: CustomerId,
    ) -> Result<Vec<Address>, ExternalError> {
        let addresses = self
            .addresses
            .read()
            .map_err(|_| ExternalError::poisoned("customers"))?;
        Ok(addresses
            .iter()
            .filter(|a| a.customer_id == customer_id)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    products: RwLock<HashMap<ProductId, CatalogProduct>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, product: CatalogProduct) -> Result<(), ExternalError> {
        let mut products = self
            .products
            .write()
            .map_err(|_| ExternalError::poisoned("catalog"))?;
        products.insert(product.id, product);
        Ok(())
    }
}

impl Catalog for InMemoryCatalog {
    fn find_product(&self, id: ProductId) -> Result<Option<CatalogProduct>, ExternalError> {
        let products = self
            .products
            .read()
            .map_err(|_| ExternalError::poisoned("catalog"))?;
        Ok(products.get(&id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPaymentMethods {
    methods: RwLock<HashMap<PaymentMethodId, PaymentMethod>>,
}

impl InMemoryPaymentMethods {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, method: PaymentMethod) -> Result<(), ExternalError> {
        let mut methods = self
            .methods
            .write()
            .map_err(|_| ExternalError::poisoned("payment methods"))?;
        methods.insert(method.id, method);
        Ok(())
    }
}

impl PaymentMethodDirectory for InMemoryPaymentMethods {
    fn find_by_id(&self, id: PaymentMethodId) -> Result<Option<PaymentMethod>, ExternalError> {
        let methods = self
            .methods
            .read()
            .map_err(|_| ExternalError::poisoned("payment methods"))?;
        Ok(methods.get(&id).cloned())
    }
}

/// Records every generated document instead of rendering anything.
#[derive(Debug, Default)]
pub struct RecordingDocumentGenerator {
    documents: RwLock<Vec<Document>>,
}

impl RecordingDocumentGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> Result<Vec<Document>, ExternalError> {
        let documents = self
            .documents
            .read()
            .map_err(|_| ExternalError::poisoned("documents"))?;
        Ok(documents.clone())
    }
}

impl DocumentGenerator for RecordingDocumentGenerator {
    fn generate(
        &self,
        order: &Order,
        document_type: DocumentType,
        staff_id: Option<StaffId>,
    ) -> Result<Document, ExternalError> {
        let prefix = match document_type {
            DocumentType::Invoice => "INV",
            DocumentType::Receipt => "RCP",
            DocumentType::ShippingLabel => "SHP",
            DocumentType::TaxInvoice => "TAX",
        };
        let document_number = format!("{prefix}-{}", order.order_number());
        let document = Document {
            id: DocumentId::new(),
            order_id: order.id_typed(),
            document_type,
            file_path: format!("documents/{document_number}.pdf"),
            document_number,
            generated_by: staff_id,
            created_at: Utc::now(),
        };

        let mut documents = self
            .documents
            .write()
            .map_err(|_| ExternalError::poisoned("documents"))?;
        documents.push(document.clone());
        Ok(document)
    }
}
