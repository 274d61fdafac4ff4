//! Tally purchase-voucher rendering.
//!
//! Every voucher carries three ledger entries: the vendor is credited with
//! the invoice total, the expense ledger (named after the category) is
//! debited with the subtotal and `Input GST` with the tax. Debits are
//! written as negative amounts with `ISDEEMEDPOSITIVE` set to `Yes`.
//!
//! Amounts are settled in whole cents before rendering. Total and tax are
//! rounded, and the subtotal is their difference unless the record states a
//! different one, so the printed entries always sum to zero when the
//! subtotal is derived.

use chrono::NaiveDate;

use crate::models::{InvoiceRecord, Settings};
use crate::utils::today;

pub const TAX_LEDGER: &str = "Input GST";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherOptions {
    pub company_name: String,
    pub state_name: String,
}

impl Default for VoucherOptions {
    fn default() -> Self {
        VoucherOptions {
            company_name: "Company Name".to_string(),
            state_name: "State".to_string(),
        }
    }
}

impl From<&Settings> for VoucherOptions {
    fn from(settings: &Settings) -> Self {
        VoucherOptions {
            company_name: settings.company_name.clone(),
            state_name: settings.state_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub ledger_name: String,
    pub is_deemed_positive: bool,
    /// Signed, in cents. Debits are negative.
    pub amount_cents: i64,
}

/// Field values after voucher defaults are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct VoucherData {
    pub date: String,
    pub voucher_number: String,
    pub party_ledger: String,
    pub entries: [LedgerEntry; 3],
}

impl VoucherData {
    pub fn from_record(record: &InvoiceRecord, today: NaiveDate) -> Self {
        let voucher_number = non_blank(record.invoice_number.as_deref())
            .unwrap_or("NA")
            .to_string();
        let date = non_blank(record.date.as_deref())
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
            .unwrap_or(today)
            .format("%Y%m%d")
            .to_string();
        let vendor = non_blank(record.vendor_name.as_deref())
            .unwrap_or("Cash")
            .to_string();
        let expense_ledger = record
            .category
            .map(|category| category.as_str())
            .unwrap_or("Direct Expenses")
            .to_string();

        let total = to_cents(record.total_or_zero());
        let tax = to_cents(record.tax_or_zero());
        let subtotal = match record.subtotal {
            Some(stated) if !matches_difference(stated, record) => to_cents(stated),
            _ => total - tax,
        };

        VoucherData {
            date,
            voucher_number,
            party_ledger: vendor.clone(),
            entries: [
                LedgerEntry {
                    ledger_name: vendor,
                    is_deemed_positive: false,
                    amount_cents: total,
                },
                LedgerEntry {
                    ledger_name: expense_ledger,
                    is_deemed_positive: true,
                    amount_cents: -subtotal,
                },
                LedgerEntry {
                    ledger_name: TAX_LEDGER.to_string(),
                    is_deemed_positive: true,
                    amount_cents: -tax,
                },
            ],
        }
    }
}

fn to_cents(value: f64) -> i64 {
    (value * 100.0).round() as i64
}

/// True when a stated subtotal is just `total - tax` up to rounding.
fn matches_difference(subtotal: f64, record: &InvoiceRecord) -> bool {
    (subtotal - (record.total_or_zero() - record.tax_or_zero())).abs() < 0.005
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Renders the voucher, using `today` when the record has no usable date.
pub fn render_voucher(record: &InvoiceRecord, options: &VoucherOptions, today: NaiveDate) -> String {
    let data = VoucherData::from_record(record, today);
    let entries: String = data.entries.iter().map(render_entry).collect();

    format!(
        r#"<ENVELOPE>
    <HEADER>
        <TALLYREQUEST>Import Data</TALLYREQUEST>
    </HEADER>
    <BODY>
        <IMPORTDATA>
            <REQUESTDESC>
                <REPORTNAME>Vouchers</REPORTNAME>
                <STATICVARIABLES>
                    <SVCURRENTCOMPANY>{company}</SVCURRENTCOMPANY>
                </STATICVARIABLES>
            </REQUESTDESC>
            <REQUESTDATA>
                <TALLYMESSAGE xmlns:UDF="TallyUDF">
                    <VOUCHER VCHTYPE="Purchase" ACTION="Create" OBJVIEW="AccountingVoucherView">
                        <DATE>{date}</DATE>
                        <VOUCHERNUMBER>{number}</VOUCHERNUMBER>
                        <REFERENCE>{number}</REFERENCE>
                        <PARTYLEDGERNAME>{party}</PARTYLEDGERNAME>
                        <STATENAME>{state}</STATENAME>
                        <PERSISTEDVIEW>AccountingVoucherView</PERSISTEDVIEW>
{entries}                    </VOUCHER>
                </TALLYMESSAGE>
            </REQUESTDATA>
        </IMPORTDATA>
    </BODY>
</ENVELOPE>"#,
        company = escape_xml(&options.company_name),
        date = escape_xml(&data.date),
        number = escape_xml(&data.voucher_number),
        party = escape_xml(&data.party_ledger),
        state = escape_xml(&options.state_name),
        entries = entries,
    )
}

pub fn render_voucher_today(record: &InvoiceRecord, options: &VoucherOptions) -> String {
    render_voucher(record, options, today())
}

fn render_entry(entry: &LedgerEntry) -> String {
    format!(
        r#"                        <ALLLEDGERENTRIES.LIST>
                            <LEDGERNAME>{}</LEDGERNAME>
                            <ISDEEMEDPOSITIVE>{}</ISDEEMEDPOSITIVE>
                            <AMOUNT>{}</AMOUNT>
                        </ALLLEDGERENTRIES.LIST>
"#,
        escape_xml(&entry.ledger_name),
        if entry.is_deemed_positive { "Yes" } else { "No" },
        format_amount(entry.amount_cents),
    )
}

fn format_amount(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
